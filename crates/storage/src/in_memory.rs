//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use threadline_core::document::{
    Document, DocumentChunk, DocumentId, DocumentStatus, NewChunk, NewDocument,
};
use threadline_core::error::StorageError;
use threadline_core::message::{
    Conversation, ConversationId, ConversationMode, ConversationStatus, Message, NewMessage,
};
use threadline_core::store::{ChunkStore, ConversationStore, DocumentStore, Page};
use threadline_core::user::User;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<String, User>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    documents: HashMap<DocumentId, Document>,
    chunks: HashMap<DocumentId, Vec<DocumentChunk>>,
    /// (conversation, document) pairs in link order
    links: Vec<(ConversationId, DocumentId)>,
}

/// A store that keeps everything in process memory.
///
/// Search ranks chunks by how many distinct query words they contain.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn query_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn not_found(what: &str, id: &str) -> StorageError {
    StorageError::QueryFailed(format!("{what} {id} not found"))
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_or_create_user(&self, user_id: &str) -> Result<User, StorageError> {
        let mut state = self.state.write().await;
        Ok(state
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| User::new(user_id))
            .clone())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        mode: ConversationMode,
        title: Option<String>,
    ) -> Result<Conversation, StorageError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(user_id) {
            return Err(StorageError::Storage(format!("unknown user {user_id}")));
        }
        let conversation = Conversation::new(user_id, mode, title);
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(id)
            .filter(|c| c.status != ConversationStatus::Deleted)
            .cloned())
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<(Vec<Conversation>, u64), StorageError> {
        let state = self.state.read().await;
        let mut owned: Vec<&Conversation> = state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id && c.status != ConversationStatus::Deleted)
            .collect();
        owned.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
        });

        let total = owned.len() as u64;
        let items = owned
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn latest_active_conversation(
        &self,
        user_id: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id && c.is_active())
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .cloned())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        match state.conversations.get_mut(id) {
            Some(conv) if conv.status != ConversationStatus::Deleted => {
                conv.status = ConversationStatus::Deleted;
                conv.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(not_found("conversation", message.conversation_id.as_str()));
        }
        let log = state
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            sequence_number: log.len() as i64 + 1,
            tokens_used: message.tokens_used,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        log.push(stored.clone());
        Ok(stored)
    }

    async fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, StorageError> {
        let state = self.state.read().await;
        Ok(state.messages.get(id).cloned().unwrap_or_default())
    }

    async fn recent_messages(
        &self,
        id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let state = self.state.read().await;
        let log = state.messages.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn message_count(&self, id: &ConversationId) -> Result<i64, StorageError> {
        let state = self.state.read().await;
        Ok(state.messages.get(id).map_or(0, |log| log.len() as i64))
    }

    async fn record_turn(
        &self,
        id: &ConversationId,
        tokens: i64,
    ) -> Result<Conversation, StorageError> {
        let mut state = self.state.write().await;
        let count = state.messages.get(id).map_or(0, |log| log.len() as i64);
        match state.conversations.get_mut(id) {
            Some(conv) if conv.status != ConversationStatus::Deleted => {
                conv.total_tokens += tokens;
                conv.total_messages = count;
                conv.updated_at = Utc::now();
                Ok(conv.clone())
            }
            _ => Err(not_found("conversation", id.as_str())),
        }
    }

    async fn link_document(
        &self,
        conversation_id: &ConversationId,
        document_id: &DocumentId,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(conversation_id) {
            return Err(not_found("conversation", conversation_id.as_str()));
        }
        if !state.documents.contains_key(document_id) {
            return Err(not_found("document", document_id.as_str()));
        }
        let pair = (conversation_id.clone(), document_id.clone());
        if !state.links.contains(&pair) {
            state.links.push(pair);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StorageError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&document.user_id) {
            return Err(StorageError::Storage(format!(
                "unknown user {}",
                document.user_id
            )));
        }
        let now = Utc::now();
        let doc = Document {
            id: DocumentId::new(),
            user_id: document.user_id,
            filename: document.filename,
            file_path: document.file_path,
            file_type: document.file_type,
            file_size: document.file_size,
            status: DocumentStatus::Processing,
            created_at: now,
            updated_at: now,
        };
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, StorageError> {
        Ok(self.state.read().await.documents.get(id).cloned())
    }

    async fn set_document_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(id) {
            doc.status = status;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_chunks(
        &self,
        id: &DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(id) {
            return Err(not_found("document", id.as_str()));
        }

        let existing = state.chunks.entry(id.clone()).or_default();
        let mut seen: Vec<u32> = existing.iter().map(|c| c.chunk_index).collect();
        for chunk in &chunks {
            if seen.contains(&chunk.chunk_index) {
                return Err(StorageError::Conflict(format!(
                    "chunk {} already exists for document {id}",
                    chunk.chunk_index
                )));
            }
            seen.push(chunk.chunk_index);
        }

        let count = chunks.len();
        existing.extend(chunks.into_iter().map(|chunk| DocumentChunk {
            id: Uuid::new_v4().to_string(),
            document_id: id.clone(),
            chunk_index: chunk.chunk_index,
            text: chunk.text,
            token_count: chunk.token_count,
        }));
        existing.sort_by_key(|c| c.chunk_index);
        Ok(count)
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn linked_documents(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DocumentId>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .links
            .iter()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn chunks_by_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let state = self.state.read().await;
        Ok(state.chunks.get(document_id).cloned().unwrap_or_default())
    }

    async fn search_chunks(
        &self,
        document_ids: &[DocumentId],
        query: &str,
        limit: usize,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let state = self.state.read().await;
        let mut scored: Vec<(usize, usize, &DocumentChunk)> = Vec::new();
        for (link_pos, doc_id) in document_ids.iter().enumerate() {
            for chunk in state.chunks.get(doc_id).into_iter().flatten() {
                let text = chunk.text.to_lowercase();
                let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
                if hits > 0 {
                    scored.push((hits, link_pos, chunk));
                }
            }
        }

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.chunk_index.cmp(&b.2.chunk_index))
        });
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, chunk)| chunk.clone())
            .collect())
    }
}
