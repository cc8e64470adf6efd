//! # Threadline Core
//!
//! Domain types, traits, and error definitions for the Threadline chat backend.
//! This crate has **no framework dependencies**: it defines the domain model
//! that every other crate implements against.
//!
//! ## Seams
//!
//! - [`Provider`]: the generation capability (ordered role/content pairs in,
//!   text plus token usage out)
//! - [`ChunkStore`]: the read interface retrieval consumes
//! - [`ConversationStore`] / [`DocumentStore`]: persistence for the rest

pub mod document;
pub mod error;
pub mod message;
pub mod provider;
pub mod store;
pub mod user;

// Re-export key types at crate root for ergonomics
pub use document::{Document, DocumentChunk, DocumentId, DocumentStatus, NewChunk, NewDocument};
pub use error::{Error, ErrorKind, ProviderError, Result, StorageError};
pub use message::{
    ContextMessage, Conversation, ConversationId, ConversationMode, ConversationStatus, Message,
    NewMessage, Role, UsageMetadata,
};
pub use provider::{Provider, ProviderRequest, ProviderResponse, Usage};
pub use store::{ChunkStore, ConversationStore, DocumentStore, Page, Store};
pub use user::User;
