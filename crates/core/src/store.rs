//! Store traits: persistence seams for conversations, documents, and chunks.
//!
//! Retrieval depends only on [`ChunkStore`]; the turn orchestrator and the
//! document ingestor use the wider [`Store`] umbrella. Implementations:
//! SQLite (FTS5 keyword search) and in-memory (for tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::document::{Document, DocumentChunk, DocumentId, DocumentStatus, NewChunk, NewDocument};
use crate::error::StorageError;
use crate::message::{Conversation, ConversationId, ConversationMode, Message, NewMessage};
use crate::user::User;

/// One page of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u32,

    /// Items per page
    #[serde(default = "default_page_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_limit() -> u32 {
    10
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_page_limit(),
        }
    }
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Rows to skip before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// Number of pages needed for `total` items.
    pub fn page_count(&self, total: u64) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        total.div_ceil(u64::from(self.limit))
    }
}

/// Read access to document chunks, as consumed by retrieval.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Documents linked to a conversation, in link order.
    async fn linked_documents(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<Vec<DocumentId>, StorageError>;

    /// All chunks of a document, ordered by index ascending.
    async fn chunks_by_document(
        &self,
        document_id: &DocumentId,
    ) -> std::result::Result<Vec<DocumentChunk>, StorageError>;

    /// Best-effort keyword relevance search limited to `document_ids`.
    ///
    /// May legitimately return fewer than `limit` results, or none.
    async fn search_chunks(
        &self,
        document_ids: &[DocumentId],
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<DocumentChunk>, StorageError>;
}

/// Users, conversations, and the message log.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Can the backend be reached?
    async fn health_check(&self) -> std::result::Result<bool, StorageError> {
        Ok(true)
    }

    async fn get_or_create_user(&self, user_id: &str) -> std::result::Result<User, StorageError>;

    async fn find_user(&self, user_id: &str) -> std::result::Result<Option<User>, StorageError>;

    async fn create_conversation(
        &self,
        user_id: &str,
        mode: ConversationMode,
        title: Option<String>,
    ) -> std::result::Result<Conversation, StorageError>;

    /// Look up a conversation. Deleted conversations are not returned.
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<Option<Conversation>, StorageError>;

    /// A user's conversations, most recently updated first, with the total count.
    async fn list_conversations(
        &self,
        user_id: &str,
        page: Page,
    ) -> std::result::Result<(Vec<Conversation>, u64), StorageError>;

    async fn latest_active_conversation(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<Conversation>, StorageError>;

    /// Soft delete. Returns `false` when nothing matched.
    async fn delete_conversation(&self, id: &ConversationId) -> std::result::Result<bool, StorageError>;

    /// Append a message, assigning the next sequence number atomically.
    async fn append_message(&self, message: NewMessage) -> std::result::Result<Message, StorageError>;

    /// The full message log, ordered by sequence number.
    async fn messages(&self, id: &ConversationId) -> std::result::Result<Vec<Message>, StorageError>;

    /// The newest `limit` messages, still in ascending sequence order.
    async fn recent_messages(
        &self,
        id: &ConversationId,
        limit: usize,
    ) -> std::result::Result<Vec<Message>, StorageError>;

    async fn message_count(&self, id: &ConversationId) -> std::result::Result<i64, StorageError>;

    /// Add `tokens` to the running total and recount messages, as one unit.
    async fn record_turn(
        &self,
        id: &ConversationId,
        tokens: i64,
    ) -> std::result::Result<Conversation, StorageError>;

    /// Link a document to a conversation. Linking twice is a no-op.
    async fn link_document(
        &self,
        conversation_id: &ConversationId,
        document_id: &DocumentId,
    ) -> std::result::Result<(), StorageError>;
}

/// Document metadata and chunk writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, document: NewDocument) -> std::result::Result<Document, StorageError>;

    async fn get_document(&self, id: &DocumentId) -> std::result::Result<Option<Document>, StorageError>;

    async fn set_document_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> std::result::Result<(), StorageError>;

    /// Insert all chunks of a document, or none of them.
    async fn insert_chunks(
        &self,
        id: &DocumentId,
        chunks: Vec<NewChunk>,
    ) -> std::result::Result<usize, StorageError>;
}

/// Everything a full backend provides.
pub trait Store: ConversationStore + DocumentStore + ChunkStore {}

impl<T: ConversationStore + DocumentStore + ChunkStore> Store for T {}
