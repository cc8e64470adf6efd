//! `threadline config`: Configuration management commands.

use super::{CmdResult, load_config};
use std::path::Path;
use threadline_config::AppConfig;

const REDACTED: &str = "***";

pub async fn validate(config_path: &Path) -> CmdResult {
    println!("🔍 Validating configuration...");

    match AppConfig::load_with_env(config_path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            if !config.has_api_key() {
                warnings.push("No API key set (set THREADLINE_API_KEY or OPENAI_API_KEY)");
            }
            if config.gateway.host == "0.0.0.0" && config.gateway.cors_origins.is_empty() {
                warnings.push("Gateway bound to 0.0.0.0 but CORS only allows localhost origins");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:  {}", config.default_provider);
            println!("   Model:     {}", config.default_model);
            println!(
                "   Context:   {} tokens ({} reserved), window {}",
                config.context.token_budget,
                config.context.response_reserve,
                config.context.window_size
            );
            println!("   Linking:   {:?}", config.documents.link_policy);
            println!("   Database:  {}", config.database.resolved_url());
            println!(
                "   Gateway:   {}:{}",
                config.gateway.host, config.gateway.port
            );
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(config_path: &Path) -> CmdResult {
    let config = redacted(load_config(config_path)?);
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(config_path: &Path) -> CmdResult {
    println!("{}", config_path.display());
    Ok(())
}

pub async fn init(config_path: &Path, force: bool) -> CmdResult {
    if config_path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(config_path, AppConfig::default_toml())?;
    println!("✅ Wrote default config to {}", config_path.display());
    Ok(())
}

/// Mask every API key before the config is printed.
fn redacted(mut config: AppConfig) -> AppConfig {
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    config
}
