//! `threadline doctor`: Diagnose system health.

use super::{CmdResult, open_store};
use std::path::Path;
use threadline_agent::GenerationSettings;
use threadline_config::AppConfig;
use threadline_core::store::ConversationStore;

pub async fn run(config_path: &Path) -> CmdResult {
    println!("🩺 Threadline Doctor — System Diagnostics");
    println!("========================================\n");

    let mut issues = 0;

    let config = if config_path.exists() {
        match AppConfig::load_with_env(config_path) {
            Ok(config) => {
                println!("  ✅ Config file valid");
                Some(config)
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                issues += 1;
                None
            }
        }
    } else {
        println!("  ⚠️  No config file, using defaults (run `threadline config init`)");
        match AppConfig::load_with_env(config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                println!("  ❌ Environment overrides invalid: {e}");
                issues += 1;
                None
            }
        }
    };

    if let Some(config) = config {
        if config.has_api_key() {
            println!("  ✅ API key configured");
        } else {
            println!("  ⚠️  No API key configured — set THREADLINE_API_KEY or add api_key to config.toml");
            issues += 1;
        }

        issues += check_provider(&config).await;

        let url = config.database.resolved_url();
        match open_store(&config).await {
            Ok(store) => match store.health_check().await {
                Ok(true) => println!("  ✅ Database reachable ({url})"),
                Ok(false) => {
                    println!("  ❌ Database not responding ({url})");
                    issues += 1;
                }
                Err(e) => {
                    println!("  ❌ Database check failed: {e}");
                    issues += 1;
                }
            },
            Err(e) => {
                println!("  ❌ {e}");
                issues += 1;
            }
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

/// Reach the default provider and look for the configured model.
async fn check_provider(config: &AppConfig) -> usize {
    let provider = match threadline_providers::build_from_config(config)
        .and_then(|router| router.default_provider())
    {
        Ok(provider) => provider,
        Err(e) => {
            println!("  ❌ Provider not configured: {e}");
            return 1;
        }
    };

    match provider.health_check().await {
        Ok(true) => println!("  ✅ Provider '{}' reachable", provider.name()),
        Ok(false) => {
            println!("  ❌ Provider '{}' rejected the request (check the API key)", provider.name());
            return 1;
        }
        Err(e) => {
            println!("  ❌ Provider '{}' unreachable: {e}", provider.name());
            return 1;
        }
    }

    let model = GenerationSettings::from(config).model;
    match provider.list_models().await {
        Ok(models) if models.is_empty() || models.contains(&model) => {
            println!("  ✅ Model '{model}' available");
            0
        }
        Ok(_) => {
            println!("  ⚠️  Model '{model}' is not in the provider's model list");
            1
        }
        Err(e) => {
            println!("  ⚠️  Could not list models: {e}");
            0
        }
    }
}
