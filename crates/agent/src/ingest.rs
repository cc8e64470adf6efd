//! Document ingest: record an upload, extract and chunk its text, link it.
//!
//! The upload is always recorded. Extraction or chunking problems only
//! mark the document `failed`; they are not returned as errors.

use crate::retrieval::TextChunker;
use serde::Serialize;
use std::sync::Arc;
use threadline_config::{DocumentConfig, DocumentLinkPolicy};
use threadline_core::document::{Document, DocumentStatus, NewDocument, file_type_of};
use threadline_core::error::{Error, Result};
use threadline_core::message::{Conversation, ConversationId};
use threadline_core::store::{ConversationStore, DocumentStore, Store};
use tracing::{info, warn};

/// Turns uploaded bytes into text.
pub trait TextExtractor: Send + Sync {
    /// Extract text, or explain why the bytes are unreadable.
    fn extract(&self, file_type: Option<&str>, bytes: &[u8]) -> std::result::Result<String, String>;
}

/// `txt` must be valid UTF-8; everything else is decoded lossily.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, file_type: Option<&str>, bytes: &[u8]) -> std::result::Result<String, String> {
        match file_type {
            Some("txt") => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| format!("text file is not valid UTF-8: {e}")),
            _ => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub user_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Conversation to link the document to, if the caller named one.
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document: Document,
    pub chunk_count: usize,
    pub linked_conversation: Option<ConversationId>,
}

pub struct DocumentIngestor {
    store: Arc<dyn Store>,
    chunker: TextChunker,
    extractor: Arc<dyn TextExtractor>,
    link_policy: DocumentLinkPolicy,
    min_text_chars: usize,
    upload_dir: String,
}

impl DocumentIngestor {
    pub fn new(store: Arc<dyn Store>, config: &DocumentConfig) -> Self {
        Self {
            store,
            chunker: TextChunker::new(config.chunk_target_tokens),
            extractor: Arc::new(PlainTextExtractor),
            link_policy: config.link_policy,
            min_text_chars: config.min_text_chars,
            upload_dir: config.upload_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Swap the text extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn ingest(&self, upload: Upload) -> Result<IngestOutcome> {
        let user_id = upload.user_id.trim();
        let filename = upload.filename.trim();
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".into()));
        }
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Err(Error::InvalidInput(format!("invalid filename '{filename}'")));
        }

        self.store.get_or_create_user(user_id).await?;
        let file_type = file_type_of(filename);
        let mut document = self
            .store
            .create_document(NewDocument {
                user_id: user_id.to_string(),
                filename: filename.to_string(),
                file_path: format!("{}/{user_id}/{filename}", self.upload_dir),
                file_type: file_type.clone(),
                file_size: upload.bytes.len() as i64,
            })
            .await?;

        let chunk_count = match self.process(&document, file_type.as_deref(), &upload.bytes).await {
            Ok(count) => {
                document.status = DocumentStatus::Processed;
                info!(document_id = %document.id, chunks = count, "Document processed");
                count
            }
            Err(reason) => {
                document.status = DocumentStatus::Failed;
                warn!(document_id = %document.id, reason = %reason, "Document processing failed");
                0
            }
        };
        self.store
            .set_document_status(&document.id, document.status)
            .await?;

        let linked_conversation = match self
            .link_target(user_id, upload.conversation_id.as_ref())
            .await?
        {
            Some(conversation) => {
                self.store
                    .link_document(&conversation.id, &document.id)
                    .await?;
                info!(
                    document_id = %document.id,
                    conversation_id = %conversation.id,
                    "Document linked"
                );
                Some(conversation.id)
            }
            None => None,
        };

        Ok(IngestOutcome {
            document,
            chunk_count,
            linked_conversation,
        })
    }

    /// Extract, chunk, and store. The error string is only logged.
    async fn process(
        &self,
        document: &Document,
        file_type: Option<&str>,
        bytes: &[u8],
    ) -> std::result::Result<usize, String> {
        let text = self.extractor.extract(file_type, bytes)?;
        let text = text.trim();
        if text.chars().count() <= self.min_text_chars {
            return Err(format!(
                "extracted text too short ({} chars)",
                text.chars().count()
            ));
        }

        let chunks = self.chunker.chunk(text);
        self.store
            .insert_chunks(&document.id, chunks)
            .await
            .map_err(|e| e.to_string())
    }

    /// The conversation the link policy picks, if any.
    async fn link_target(
        &self,
        user_id: &str,
        requested: Option<&ConversationId>,
    ) -> Result<Option<Conversation>> {
        if let Some(id) = requested {
            return match self.store.get_conversation(id).await? {
                Some(conversation) if conversation.user_id == user_id => Ok(Some(conversation)),
                Some(_) => {
                    warn!(conversation_id = %id, user_id, "Not linking to another user's conversation");
                    Ok(None)
                }
                None => {
                    warn!(conversation_id = %id, "Not linking to unknown conversation");
                    Ok(None)
                }
            };
        }

        match self.link_policy {
            DocumentLinkPolicy::ExplicitOnly => Ok(None),
            DocumentLinkPolicy::LatestActiveConversation => {
                let latest = self.store.latest_active_conversation(user_id).await?;
                if latest.is_none() {
                    info!(user_id, "No active conversation to link the document to");
                }
                Ok(latest)
            }
        }
    }
}
