//! Configuration loading, validation, and management for Threadline.
//!
//! Loads configuration from `~/.threadline/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.threadline/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Cap on generated tokens per reply (unset = provider default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_tokens: Option<u32>,

    /// How many times a rate-limited request is retried
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// Context window management
    #[serde(default)]
    pub context: ContextConfig,

    /// Document ingest
    #[serde(default)]
    pub documents: DocumentConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_rate_limit_retries() -> u32 {
    2
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("rate_limit_retries", &self.rate_limit_retries)
            .field("context", &self.context)
            .field("documents", &self.documents)
            .field("database", &self.database)
            .field("gateway", &self.gateway)
            .field("logging", &self.logging)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Token budget, window, and retrieval limits for context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Ceiling on the estimated tokens of the assembled context
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Tokens held back for the model's reply during truncation
    #[serde(default = "default_response_reserve")]
    pub response_reserve: usize,

    /// Most recent history messages considered per turn
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Cap on retrieved chunks per turn
    #[serde(default = "default_max_retrieval_chunks")]
    pub max_retrieval_chunks: usize,

    /// Leading chunks taken per document when search finds nothing
    #[serde(default = "default_fallback_chunks_per_document")]
    pub fallback_chunks_per_document: usize,

    /// Offset of the clock shown in the system directive, in minutes east of UTC
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

fn default_token_budget() -> usize {
    4000
}
fn default_response_reserve() -> usize {
    100
}
fn default_window_size() -> usize {
    20
}
fn default_max_retrieval_chunks() -> usize {
    5
}
fn default_fallback_chunks_per_document() -> usize {
    3
}
fn default_utc_offset_minutes() -> i32 {
    330
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            response_reserve: default_response_reserve(),
            window_size: default_window_size(),
            max_retrieval_chunks: default_max_retrieval_chunks(),
            fallback_chunks_per_document: default_fallback_chunks_per_document(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

/// Which conversation an uploaded document is attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentLinkPolicy {
    /// Only the conversation named in the upload.
    ExplicitOnly,
    /// The named conversation, else the uploader's most recently updated active one.
    #[default]
    LatestActiveConversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    #[serde(default)]
    pub link_policy: DocumentLinkPolicy,

    /// Target chunk size in estimated tokens
    #[serde(default = "default_chunk_target_tokens")]
    pub chunk_target_tokens: usize,

    /// Extracted text at or below this many characters is rejected
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,

    /// Prefix recorded as the document's storage path
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

fn default_chunk_target_tokens() -> usize {
    500
}
fn default_min_text_chars() -> usize {
    10
}
fn default_upload_dir() -> String {
    "uploads".into()
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            link_policy: DocumentLinkPolicy::default(),
            chunk_target_tokens: default_chunk_target_tokens(),
            min_text_chars: default_min_text_chars(),
            upload_dir: default_upload_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; a leading `~` in the path is expanded
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://~/.threadline/threadline.db".into()
}
fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// The URL with `~` replaced by the home directory.
    pub fn resolved_url(&self) -> String {
        expand_home(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Upper bound on request bodies (document uploads included)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,

    /// Allowed CORS origins; empty allows localhost origins only
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_rate_limit_per_minute() -> usize {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_body_bytes: default_max_body_bytes(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            cors_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.threadline/config.toml).
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides and re-validate.
    ///
    /// API keys are read from `THREADLINE_API_KEY` then `OPENAI_API_KEY`,
    /// only when the file sets none.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = var("THREADLINE_API_KEY").or_else(|| var("OPENAI_API_KEY"));
        }

        if let Some(provider) = var("THREADLINE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = var("THREADLINE_MODEL") {
            self.default_model = model;
        }

        if let Some(url) = var("THREADLINE_DATABASE_URL") {
            self.database.url = url;
        }

        if let Some(level) = var("THREADLINE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(raw) = var("THREADLINE_TOKEN_BUDGET") {
            self.context.token_budget = parse_env("THREADLINE_TOKEN_BUDGET", &raw)?;
        }

        if let Some(raw) = var("THREADLINE_MAX_RETRIEVAL_CHUNKS") {
            self.context.max_retrieval_chunks =
                parse_env("THREADLINE_MAX_RETRIEVAL_CHUNKS", &raw)?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".threadline")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let ctx = &self.context;
        if ctx.token_budget <= ctx.response_reserve {
            return Err(ConfigError::ValidationError(format!(
                "context.token_budget ({}) must exceed context.response_reserve ({})",
                ctx.token_budget, ctx.response_reserve
            )));
        }

        if ctx.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "context.window_size must be > 0".into(),
            ));
        }

        if ctx.max_retrieval_chunks == 0 || ctx.fallback_chunks_per_document == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_retrieval_chunks and context.fallback_chunks_per_document must be > 0"
                    .into(),
            ));
        }

        if !(-720..=840).contains(&ctx.utc_offset_minutes) {
            return Err(ConfigError::ValidationError(
                "context.utc_offset_minutes must be between -720 and 840".into(),
            ));
        }

        if self.documents.chunk_target_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "documents.chunk_target_tokens must be > 0".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: None,
            rate_limit_retries: default_rate_limit_retries(),
            context: ContextConfig::default(),
            documents: DocumentConfig::default(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
            providers: HashMap::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}={raw} is not a valid number")))
}

/// Replace a `~` path segment with the home directory.
fn expand_home(url: &str) -> String {
    let home = dirs_home();
    let home = home.to_string_lossy();
    if let Some(rest) = url.strip_prefix("sqlite://~") {
        format!("sqlite://{home}{rest}")
    } else if let Some(rest) = url.strip_prefix('~') {
        format!("{home}{rest}")
    } else {
        url.to_string()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
