//! Error types for the Threadline domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant, and every failure maps
//! onto one [`ErrorKind`] so callers can pick a policy without string matching.

use thiserror::Error;

/// The top-level error type for all Threadline operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Context assembly ---
    /// The framing messages plus the newest turn cannot fit the token budget.
    #[error(
        "Context too long even after truncation ({system_tokens} system tokens, budget {budget}). \
         Please start a new conversation."
    )]
    ContextOverflow { system_tokens: usize, budget: usize },

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Lookups ---
    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error("User {0} not found")]
    UserNotFound(String),

    // --- Caller mistakes ---
    #[error("Invalid input: {0}")]
    InvalidInput(String),

}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// The coarse failure categories exposed to callers.
///
/// Rate limits deserve a backoff-and-retry, overflow deserves a fresh
/// conversation, everything else is either the caller's fault or ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContextOverflow,
    RateLimited,
    ServiceUnavailable,
    NotFound,
    InvalidInput,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            Self::Provider(ProviderError::RateLimited { .. }) => ErrorKind::RateLimited,
            Self::Provider(_) => ErrorKind::ServiceUnavailable,
            Self::ConversationNotFound(_) | Self::DocumentNotFound(_) | Self::UserNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Transient failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServiceUnavailable(_) | Self::Timeout(_) | Self::Network(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}
