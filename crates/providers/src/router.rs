//! Provider router: selects the LLM provider named in config.

use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::RetryingProvider;
use std::collections::HashMap;
use std::sync::Arc;
use threadline_core::error::ProviderError;
use threadline_core::provider::Provider;

/// Named providers plus the default one.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// The default provider, or `NotConfigured` if it was never registered.
    pub fn default_provider(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        self.get(&self.default_provider).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "default provider '{}' is not registered",
                self.default_provider
            ))
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Build providers from configuration.
///
/// Every configured provider, plus the default one, is an
/// OpenAI-compatible client wrapped in rate-limit retries. A provider
/// with neither an `api_url` nor a known endpoint is `NotConfigured`.
pub fn build_from_config(
    config: &threadline_config::AppConfig,
) -> Result<ProviderRouter, ProviderError> {
    let mut router = ProviderRouter::new(&config.default_provider);

    let default_entry = config.providers.get(&config.default_provider);
    let entries = config
        .providers
        .iter()
        .map(|(name, entry)| (name.as_str(), Some(entry)))
        .chain(
            default_entry
                .is_none()
                .then_some((config.default_provider.as_str(), None)),
        );

    for (name, entry) in entries {
        let api_key = entry
            .and_then(|e| e.api_key.as_deref())
            .or(config.api_key.as_deref())
            .unwrap_or_default();
        let base_url = match entry.and_then(|e| e.api_url.as_deref()) {
            Some(url) => url,
            None => known_endpoint(name).ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "provider '{name}' needs an api_url in [providers.{name}]"
                ))
            })?,
        };

        let client = Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)?);
        router.register(
            name,
            Arc::new(RetryingProvider::new(client, config.rate_limit_retries)),
        );
    }

    Ok(router)
}

/// Chat-completions base URL of a well-known OpenAI-compatible service.
fn known_endpoint(provider_name: &str) -> Option<&'static str> {
    let url = match provider_name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    };
    Some(url)
}
