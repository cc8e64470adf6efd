pub mod chat;
pub mod config_cmd;
pub mod conversations;
pub mod doctor;
pub mod ingest;
pub mod serve;

use std::path::Path;
use std::sync::Arc;
use threadline_agent::Runtime;
use threadline_config::AppConfig;
use threadline_core::store::Store;
use threadline_storage::SqliteStore;

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Load the config file plus environment overrides.
pub(crate) fn load_config(path: &Path) -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load_with_env(path).map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Open the configured database.
pub(crate) async fn open_store(
    config: &AppConfig,
) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    let store = SqliteStore::new(
        &config.database.resolved_url(),
        config.database.max_connections,
    )
    .await
    .map_err(|e| format!("Failed to open database: {e}"))?;
    Ok(Arc::new(store))
}

/// The database plus the default provider, wired into a runtime.
pub(crate) async fn open_runtime(config: &AppConfig) -> Result<Runtime, Box<dyn std::error::Error>> {
    if !config.has_api_key() && config.default_provider != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    THREADLINE_API_KEY=sk-...");
        eprintln!("    OPENAI_API_KEY=sk-...");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file.");
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let store = open_store(config).await?;
    let provider = threadline_providers::build_from_config(config)?.default_provider()?;
    Ok(Runtime::new(config, store, provider))
}
