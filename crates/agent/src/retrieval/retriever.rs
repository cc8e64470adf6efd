//! Chunk retrieval for grounded turns.
//!
//! Keyword search over a conversation's linked documents, with a fallback
//! to the leading chunks of each document when the search finds nothing.
//! Retrieval failures never reach the caller as errors: they come back as
//! [`Retrieval::Empty`] with the reason attached.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use threadline_core::document::DocumentChunk;
use threadline_core::message::ConversationId;
use threadline_core::store::ChunkStore;
use tracing::{debug, info, warn};

/// Retrieval limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverConfig {
    /// Cap on chunks returned per call.
    pub max_chunks: usize,
    /// Leading chunks taken from each document by the fallback.
    pub fallback_per_document: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            max_chunks: 5,
            fallback_per_document: 3,
        }
    }
}

/// Where retrieved chunks came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Search,
    Fallback,
}

/// Why retrieval produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum EmptyReason {
    /// The conversation has no linked documents.
    NoLinkedDocuments,
    /// Documents are linked but hold no chunks.
    NoChunks,
    /// The store failed; logged and swallowed.
    Failed(String),
}

/// Outcome of one retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieval {
    Chunks {
        chunks: Vec<DocumentChunk>,
        source: RetrievalSource,
    },
    Empty {
        reason: EmptyReason,
    },
}

impl Retrieval {
    /// Chunk texts in retrieval order; empty for [`Retrieval::Empty`].
    pub fn texts(&self) -> Vec<String> {
        match self {
            Self::Chunks { chunks, .. } => chunks.iter().map(|c| c.text.clone()).collect(),
            Self::Empty { .. } => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Chunks { chunks, .. } => chunks.len(),
            Self::Empty { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source(&self) -> Option<RetrievalSource> {
        match self {
            Self::Chunks { source, .. } => Some(*source),
            Self::Empty { .. } => None,
        }
    }
}

/// Retrieves document chunks for a conversation's query.
///
/// Holds no per-call state; share one behind an `Arc` across tasks.
pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: Arc<dyn ChunkStore>, config: RetrieverConfig) -> Self {
        Self { store, config }
    }

    /// Retrieve up to `max_chunks` chunks relevant to `query`.
    pub async fn retrieve(&self, conversation_id: &ConversationId, query: &str) -> Retrieval {
        match self.try_retrieve(conversation_id, query).await {
            Ok(retrieval) => retrieval,
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Retrieval failed; continuing without document context"
                );
                Retrieval::Empty {
                    reason: EmptyReason::Failed(e.to_string()),
                }
            }
        }
    }

    async fn try_retrieve(
        &self,
        conversation_id: &ConversationId,
        query: &str,
    ) -> Result<Retrieval, threadline_core::StorageError> {
        let documents = self.store.linked_documents(conversation_id).await?;
        if documents.is_empty() {
            debug!(conversation_id = %conversation_id, "No documents linked");
            return Ok(Retrieval::Empty {
                reason: EmptyReason::NoLinkedDocuments,
            });
        }

        let max = self.config.max_chunks;
        let mut hits = self.store.search_chunks(&documents, query, max).await?;
        if !hits.is_empty() {
            hits.truncate(max);
            info!(
                conversation_id = %conversation_id,
                chunks = hits.len(),
                "Retrieved chunks by keyword search"
            );
            return Ok(Retrieval::Chunks {
                chunks: hits,
                source: RetrievalSource::Search,
            });
        }

        // Fallback: leading chunks of each document, in link order.
        let mut fallback: Vec<DocumentChunk> = Vec::new();
        for document_id in &documents {
            if fallback.len() >= max {
                break;
            }
            let chunks = self.store.chunks_by_document(document_id).await?;
            fallback.extend(chunks.into_iter().take(self.config.fallback_per_document));
        }
        fallback.truncate(max);

        if fallback.is_empty() {
            warn!(conversation_id = %conversation_id, "Linked documents have no chunks");
            return Ok(Retrieval::Empty {
                reason: EmptyReason::NoChunks,
            });
        }

        info!(
            conversation_id = %conversation_id,
            chunks = fallback.len(),
            "Search matched nothing; using leading chunks"
        );
        Ok(Retrieval::Chunks {
            chunks: fallback,
            source: RetrievalSource::Fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use threadline_core::document::{DocumentId, NewChunk, NewDocument};
    use threadline_core::error::StorageError;
    use threadline_core::message::ConversationMode;
    use threadline_core::store::{ConversationStore, DocumentStore};
    use threadline_storage::{InMemoryStore, SqliteStore};

    async fn conversation_with_docs<S>(
        store: &Arc<S>,
        docs: &[&[&str]],
    ) -> (ConversationId, Vec<DocumentId>)
    where
        S: ConversationStore + DocumentStore,
    {
        store.get_or_create_user("u1").await.unwrap();
        let conv = store
            .create_conversation("u1", ConversationMode::GroundedChat, None)
            .await
            .unwrap();
        let mut ids = Vec::new();
        for texts in docs {
            let doc = store
                .create_document(NewDocument {
                    user_id: "u1".into(),
                    filename: "f.txt".into(),
                    file_path: "uploads/u1/f.txt".into(),
                    file_type: Some("txt".into()),
                    file_size: 1,
                })
                .await
                .unwrap();
            let chunks = texts
                .iter()
                .enumerate()
                .map(|(i, t)| NewChunk {
                    chunk_index: i as u32,
                    text: (*t).into(),
                    token_count: 1,
                })
                .collect();
            store.insert_chunks(&doc.id, chunks).await.unwrap();
            store.link_document(&conv.id, &doc.id).await.unwrap();
            ids.push(doc.id);
        }
        (conv.id, ids)
    }

    fn retriever<S: ChunkStore + 'static>(store: Arc<S>) -> Retriever {
        Retriever::new(store, RetrieverConfig::default())
    }

    /// A chunk store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl ChunkStore for BrokenStore {
        async fn linked_documents(
            &self,
            _: &ConversationId,
        ) -> Result<Vec<DocumentId>, StorageError> {
            Err(StorageError::Storage("database is locked".into()))
        }

        async fn chunks_by_document(
            &self,
            _: &DocumentId,
        ) -> Result<Vec<DocumentChunk>, StorageError> {
            Err(StorageError::Storage("database is locked".into()))
        }

        async fn search_chunks(
            &self,
            _: &[DocumentId],
            _: &str,
            _: usize,
        ) -> Result<Vec<DocumentChunk>, StorageError> {
            Err(StorageError::Storage("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn no_linked_documents_is_empty_not_error() {
        let store = Arc::new(InMemoryStore::new());
        let (conv, _) = conversation_with_docs(&store, &[]).await;
        let result = retriever(store).retrieve(&conv, "anything").await;
        assert_eq!(
            result,
            Retrieval::Empty {
                reason: EmptyReason::NoLinkedDocuments
            }
        );
        assert!(result.texts().is_empty());
    }

    #[tokio::test]
    async fn search_hits_are_returned() {
        let store = Arc::new(InMemoryStore::new());
        let (conv, _) =
            conversation_with_docs(&store, &[&["pricing is monthly", "support hours"]]).await;
        let result = retriever(store).retrieve(&conv, "pricing").await;
        assert_eq!(result.source(), Some(RetrievalSource::Search));
        assert_eq!(result.texts(), vec!["pricing is monthly".to_string()]);
    }

    #[tokio::test]
    async fn fallback_takes_three_per_document_in_link_order() {
        let store = Arc::new(InMemoryStore::new());
        let (conv, _) = conversation_with_docs(
            &store,
            &[&["a0", "a1", "a2", "a3"], &["b0", "b1", "b2", "b3"]],
        )
        .await;
        let result = retriever(store).retrieve(&conv, "zzz").await;
        assert_eq!(result.source(), Some(RetrievalSource::Fallback));
        assert_eq!(result.texts(), vec!["a0", "a1", "a2", "b0", "b1"]);
    }

    #[tokio::test]
    async fn sqlite_ties_follow_link_order_then_chunk_index() {
        let store = Arc::new(SqliteStore::new("sqlite::memory:", 4).await.unwrap());
        let (conv, docs) = conversation_with_docs(
            &store,
            &[
                &["Refund policy applies."],
                &["Refund policy applies.", "Refund policy applies."],
            ],
        )
        .await;
        let result = retriever(store).retrieve(&conv, "refund").await;
        assert_eq!(result.source(), Some(RetrievalSource::Search));
        match result {
            Retrieval::Chunks { chunks, .. } => {
                let order: Vec<(DocumentId, u32)> = chunks
                    .iter()
                    .map(|c| (c.document_id.clone(), c.chunk_index))
                    .collect();
                assert_eq!(
                    order,
                    vec![(docs[0].clone(), 0), (docs[1].clone(), 0), (docs[1].clone(), 1)]
                );
            }
            other => panic!("expected chunks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sqlite_substring_match_counts_as_search() {
        let store = Arc::new(SqliteStore::new("sqlite::memory:", 4).await.unwrap());
        let (conv, _) = conversation_with_docs(
            &store,
            &[&["The subcontractor signed.", "Unrelated text."]],
        )
        .await;
        let result = retriever(store).retrieve(&conv, "contract").await;
        assert_eq!(result.source(), Some(RetrievalSource::Search));
        assert_eq!(result.texts(), vec!["The subcontractor signed.".to_string()]);
    }

    #[tokio::test]
    async fn sqlite_miss_falls_back_in_link_order() {
        let store = Arc::new(SqliteStore::new("sqlite::memory:", 4).await.unwrap());
        let (conv, _) = conversation_with_docs(
            &store,
            &[&["a0", "a1", "a2", "a3"], &["b0", "b1"]],
        )
        .await;
        let result = retriever(store).retrieve(&conv, "zzz").await;
        assert_eq!(result.source(), Some(RetrievalSource::Fallback));
        assert_eq!(result.texts(), vec!["a0", "a1", "a2", "b0", "b1"]);
    }

    #[tokio::test]
    async fn fallback_respects_smaller_documents() {
        let store = Arc::new(InMemoryStore::new());
        let (conv, _) = conversation_with_docs(&store, &[&["a0"], &["b0", "b1"]]).await;
        let result = retriever(store).retrieve(&conv, "zzz").await;
        assert_eq!(result.texts(), vec!["a0", "b0", "b1"]);
    }

    #[tokio::test]
    async fn results_never_exceed_max_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let texts: Vec<String> = (0..12).map(|i| format!("widget {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let (conv, _) = conversation_with_docs(&store, &[&refs]).await;
        let config = RetrieverConfig {
            max_chunks: 4,
            fallback_per_document: 3,
        };
        let result = Retriever::new(store, config).retrieve(&conv, "widget").await;
        assert_eq!(result.len(), 4);
    }

    #[tokio::test]
    async fn documents_without_chunks_are_empty() {
        let store = Arc::new(InMemoryStore::new());
        let (conv, _) = conversation_with_docs(&store, &[&[]]).await;
        let result = retriever(store).retrieve(&conv, "q").await;
        assert_eq!(
            result,
            Retrieval::Empty {
                reason: EmptyReason::NoChunks
            }
        );
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let retriever = Retriever::new(Arc::new(BrokenStore), RetrieverConfig::default());
        let result = retriever
            .retrieve(&ConversationId::from("c1"), "question")
            .await;
        match result {
            Retrieval::Empty {
                reason: EmptyReason::Failed(msg),
            } => assert!(msg.contains("locked")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
