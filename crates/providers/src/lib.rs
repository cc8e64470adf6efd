//! LLM provider implementations for Threadline.
//!
//! All providers implement the `threadline_core::Provider` trait.
//! The router builds the configured providers, each wrapped in
//! rate-limit retries.

pub mod openai_compat;
pub mod retry;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryingProvider;
pub use router::{ProviderRouter, build_from_config};
