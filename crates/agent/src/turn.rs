//! The turn orchestrator: persistence, context, generation, persistence.
//!
//! One turn:
//!
//! 1. Take the conversation's write lock
//! 2. Persist the user message
//! 3. Load the history window and linked documents
//! 4. Prepare context (retrieval + assembly)
//! 5. Generate
//! 6. Persist the assistant reply and update the running counters
//!
//! Turns on different conversations run concurrently; turns on the same
//! conversation are serialized so sequence numbers stay gapless.

use crate::context::AssemblyMetadata;
use crate::pipeline::{ContextPipeline, PrepareRequest, PreparedContext, RagSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use threadline_core::document::DocumentId;
use threadline_core::error::{Error, Result};
use threadline_core::message::{
    ContextMessage, Conversation, ConversationId, ConversationMode, Message, NewMessage,
    UsageMetadata,
};
use threadline_core::provider::{Provider, ProviderRequest};
use threadline_core::store::{ChunkStore, ConversationStore, DocumentStore, Store};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Model parameters for generation.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// History messages loaded per turn.
    pub history_window: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            max_tokens: None,
            history_window: 20,
        }
    }
}

/// A request to open a conversation with its first message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartConversation {
    pub user_id: String,
    pub first_message: String,
    #[serde(default)]
    pub mode: ConversationMode,
    /// Documents to link; honoured only in grounded mode.
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Everything a completed turn produced.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// The conversation after its counters were updated.
    pub conversation: Conversation,
    pub user_message: Message,
    pub assistant_message: Message,
    /// Tokens the provider reported for this turn.
    pub tokens_used: u32,
    /// Running total for the conversation.
    pub total_tokens: i64,
    pub rag: RagSummary,
    pub context: AssemblyMetadata,
}

/// Drives turns end to end.
pub struct TurnOrchestrator {
    store: Arc<dyn Store>,
    pipeline: ContextPipeline,
    provider: Arc<dyn Provider>,
    settings: GenerationSettings,
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: ContextPipeline,
        provider: Arc<dyn Provider>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            provider,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Create a conversation and run its first turn.
    pub async fn start_conversation(&self, request: StartConversation) -> Result<TurnOutcome> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".into()));
        }
        validate_content(&request.first_message)?;

        self.store.get_or_create_user(user_id).await?;
        let conversation = self
            .store
            .create_conversation(user_id, request.mode, request.title.clone())
            .await?;
        info!(
            conversation_id = %conversation.id,
            user_id,
            mode = request.mode.as_str(),
            "Conversation created"
        );

        if request.mode == ConversationMode::GroundedChat {
            for document_id in &request.document_ids {
                self.link_owned_document(&conversation, document_id).await?;
            }
        }

        self.run_turn(&conversation, &request.first_message).await
    }

    /// Add a user message to an existing conversation and generate a reply.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<TurnOutcome> {
        validate_content(content)?;
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        self.run_turn(&conversation, content).await
    }

    /// Show the context a message would be sent with, without generating
    /// or persisting anything.
    pub async fn preview_context(
        &self,
        conversation_id: &ConversationId,
        query: &str,
    ) -> Result<PreparedContext> {
        validate_content(query)?;
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;

        let mut history = self.load_history(conversation_id).await?;
        history.push(ContextMessage::user(query));
        let linked = self.store.linked_documents(conversation_id).await?;

        self.pipeline
            .prepare_context(PrepareRequest {
                conversation_id,
                history: &history,
                mode: conversation.mode,
                query,
                linked_documents_present: !linked.is_empty(),
            })
            .await
    }

    async fn run_turn(&self, conversation: &Conversation, content: &str) -> Result<TurnOutcome> {
        let lock = self.lock_for(&conversation.id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.turn_locked(conversation, content).await
        };
        self.release_lock(&conversation.id, lock).await;
        outcome
    }

    /// The body of a turn; the caller holds the conversation's lock.
    async fn turn_locked(&self, conversation: &Conversation, content: &str) -> Result<TurnOutcome> {
        let id = &conversation.id;
        let user_message = self
            .store
            .append_message(NewMessage::user(id, content))
            .await?;

        let history = self.load_history(id).await?;
        let linked = self.store.linked_documents(id).await?;

        let prepared = self
            .pipeline
            .prepare_context(PrepareRequest {
                conversation_id: id,
                history: &history,
                mode: conversation.mode,
                query: content,
                linked_documents_present: !linked.is_empty(),
            })
            .await?;

        let request = ProviderRequest::new(&self.settings.model, prepared.context.messages.clone())
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens);

        let response = self.provider.complete(request).await.map_err(|e| {
            warn!(
                conversation_id = %id,
                provider = self.provider.name(),
                error = %e,
                "Generation failed"
            );
            Error::Provider(e)
        })?;

        let usage = response.usage;
        let assistant_message = self
            .store
            .append_message(NewMessage::assistant(
                id,
                response.content,
                i64::from(usage.total_tokens),
                UsageMetadata {
                    model: response.model,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                },
            ))
            .await?;

        let updated = self
            .store
            .record_turn(id, i64::from(usage.total_tokens))
            .await?;

        info!(
            conversation_id = %id,
            tokens = usage.total_tokens,
            total_tokens = updated.total_tokens,
            rag = prepared.rag.enabled,
            chunks = prepared.rag.chunks_used,
            "Turn complete"
        );

        Ok(TurnOutcome {
            total_tokens: updated.total_tokens,
            conversation: updated,
            user_message,
            assistant_message,
            tokens_used: usage.total_tokens,
            rag: prepared.rag,
            context: prepared.context.metadata,
        })
    }

    async fn load_history(&self, id: &ConversationId) -> Result<Vec<ContextMessage>> {
        let messages = self
            .store
            .recent_messages(id, self.settings.history_window)
            .await?;
        Ok(messages.iter().map(ContextMessage::from).collect())
    }

    /// Link a document if it exists and belongs to the conversation's owner.
    async fn link_owned_document(
        &self,
        conversation: &Conversation,
        document_id: &DocumentId,
    ) -> Result<()> {
        match self.store.get_document(document_id).await? {
            Some(doc) if doc.user_id == conversation.user_id => {
                self.store.link_document(&conversation.id, document_id).await?;
                info!(conversation_id = %conversation.id, document_id = %document_id, "Document linked");
            }
            Some(_) => warn!(
                conversation_id = %conversation.id,
                document_id = %document_id,
                "Skipping document owned by another user"
            ),
            None => warn!(
                conversation_id = %conversation.id,
                document_id = %document_id,
                "Skipping unknown document"
            ),
        }
        Ok(())
    }

    async fn lock_for(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    /// Forget the lock once no other turn holds a handle to it.
    async fn release_lock(&self, id: &ConversationId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::InvalidInput("message content must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAssembler, TokenBudget};
    use crate::retrieval::{Retriever, RetrieverConfig};
    use crate::test_helpers::ScriptedProvider;
    use threadline_core::document::{NewChunk, NewDocument};
    use threadline_core::error::{ErrorKind, ProviderError};
    use threadline_core::message::Role;
    use threadline_core::store::{ChunkStore, ConversationStore, DocumentStore};
    use threadline_storage::InMemoryStore;

    fn orchestrator(
        store: Arc<InMemoryStore>,
        provider: Arc<ScriptedProvider>,
        budget: TokenBudget,
    ) -> TurnOrchestrator {
        let retriever = Arc::new(Retriever::new(store.clone(), RetrieverConfig::default()));
        let pipeline = ContextPipeline::new(retriever, ContextAssembler::new(budget), 330);
        TurnOrchestrator::new(store, pipeline, provider, GenerationSettings::default())
    }

    async fn upload(store: &InMemoryStore, user: &str, text: &str) -> DocumentId {
        store.get_or_create_user(user).await.unwrap();
        let doc = store
            .create_document(NewDocument {
                user_id: user.into(),
                filename: "handbook.txt".into(),
                file_path: format!("uploads/{user}/handbook.txt"),
                file_type: Some("txt".into()),
                file_size: text.len() as i64,
            })
            .await
            .unwrap();
        store
            .insert_chunks(
                &doc.id,
                vec![NewChunk {
                    chunk_index: 0,
                    text: text.into(),
                    token_count: 5,
                }],
            )
            .await
            .unwrap();
        doc.id
    }

    fn start(user: &str, message: &str) -> StartConversation {
        StartConversation {
            user_id: user.into(),
            first_message: message.into(),
            ..StartConversation::default()
        }
    }

    #[tokio::test]
    async fn first_turn_persists_both_messages_and_stats() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::replying("Hi! How can I help?"));
        let orch = orchestrator(store.clone(), provider.clone(), TokenBudget::default());

        let outcome = orch.start_conversation(start("alice", "Hello")).await.unwrap();

        assert_eq!(outcome.user_message.sequence_number, 1);
        assert_eq!(outcome.assistant_message.sequence_number, 2);
        assert_eq!(outcome.assistant_message.content, "Hi! How can I help?");
        assert_eq!(outcome.tokens_used, 15);
        assert_eq!(outcome.total_tokens, 15);
        assert_eq!(outcome.conversation.total_messages, 2);
        assert!(!outcome.rag.enabled);

        let meta = outcome.assistant_message.metadata.unwrap();
        assert_eq!(meta.prompt_tokens, 10);
        assert_eq!(meta.completion_tokens, 5);

        let sent = provider.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].messages[0].role, Role::System);
        assert_eq!(sent[0].messages.last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn follow_up_sees_history_and_accumulates_tokens() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let orch = orchestrator(store.clone(), provider.clone(), TokenBudget::default());

        let first = orch.start_conversation(start("alice", "one")).await.unwrap();
        let second = orch
            .send_message(&first.conversation.id, "two")
            .await
            .unwrap();

        assert_eq!(second.user_message.sequence_number, 3);
        assert_eq!(second.total_tokens, 30);
        assert_eq!(second.conversation.total_messages, 4);

        let sent = provider.requests();
        let contents: Vec<&str> = sent[1].messages[1..]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["one", "ok", "two"]);
    }

    #[tokio::test]
    async fn grounded_start_links_only_owned_documents() {
        let store = Arc::new(InMemoryStore::new());
        let mine = upload(&store, "alice", "The office opens at nine.").await;
        let theirs = upload(&store, "bob", "Bob's secrets.").await;
        let provider = Arc::new(ScriptedProvider::replying("At nine."));
        let orch = orchestrator(store.clone(), provider.clone(), TokenBudget::default());

        let outcome = orch
            .start_conversation(StartConversation {
                user_id: "alice".into(),
                first_message: "When does the office open?".into(),
                mode: ConversationMode::GroundedChat,
                document_ids: vec![mine.clone(), theirs, DocumentId::from("missing")],
                title: None,
            })
            .await
            .unwrap();

        let linked = store.linked_documents(&outcome.conversation.id).await.unwrap();
        assert_eq!(linked, vec![mine]);
        assert!(outcome.rag.enabled);
        assert_eq!(outcome.rag.chunks_used, 1);
        let sent = provider.requests();
        assert!(sent[0].messages[1].content.contains("office opens at nine"));
    }

    #[tokio::test]
    async fn open_chat_ignores_document_ids() {
        let store = Arc::new(InMemoryStore::new());
        let doc = upload(&store, "alice", "text").await;
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let orch = orchestrator(store.clone(), provider, TokenBudget::default());

        let outcome = orch
            .start_conversation(StartConversation {
                document_ids: vec![doc],
                ..start("alice", "hi")
            })
            .await
            .unwrap();
        assert!(store
            .linked_documents(&outcome.conversation.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(
            store,
            Arc::new(ScriptedProvider::replying("x")),
            TokenBudget::default(),
        );
        let err = orch
            .send_message(&ConversationId::from("nope"), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(
            store,
            Arc::new(ScriptedProvider::replying("x")),
            TokenBudget::default(),
        );
        let err = orch.start_conversation(start("alice", "   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn rate_limit_keeps_user_message_and_skips_stats() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(ScriptedProvider::text_response("first")),
            Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            }),
        ]));
        let orch = orchestrator(store.clone(), provider, TokenBudget::default());

        let first = orch.start_conversation(start("alice", "one")).await.unwrap();
        let err = orch
            .send_message(&first.conversation.id, "two")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let id = &first.conversation.id;
        assert_eq!(store.message_count(id).await.unwrap(), 3);
        let conv = store.get_conversation(id).await.unwrap().unwrap();
        assert_eq!(conv.total_tokens, 15);
        assert_eq!(conv.total_messages, 2);
    }

    #[tokio::test]
    async fn overflow_surfaces_without_calling_provider() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::replying("never"));
        let budget = TokenBudget {
            total: 60,
            response_reserve: 10,
            window_size: 20,
        };
        let orch = orchestrator(store, provider.clone(), budget);

        let err = orch
            .start_conversation(start("alice", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContextOverflow);
        assert!(err.to_string().contains("start a new conversation"));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn preview_does_not_persist() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let orch = orchestrator(store.clone(), provider.clone(), TokenBudget::default());
        let first = orch.start_conversation(start("alice", "one")).await.unwrap();

        let preview = orch
            .preview_context(&first.conversation.id, "what next?")
            .await
            .unwrap();
        assert_eq!(
            preview.context.messages.last().unwrap().content,
            "what next?"
        );
        assert_eq!(store.message_count(&first.conversation.id).await.unwrap(), 2);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_turns_keep_sequences_gapless() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::replying("ok"));
        let orch = Arc::new(orchestrator(
            store.clone(),
            provider,
            TokenBudget::default(),
        ));
        let first = orch.start_conversation(start("alice", "one")).await.unwrap();
        let id = first.conversation.id.clone();

        let mut handles = Vec::new();
        for i in 0..5 {
            let orch = orch.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                orch.send_message(&id, &format!("msg {i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.messages(&id).await.unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, (1..=12).collect::<Vec<i64>>());
        // Each user message is immediately followed by its reply.
        for pair in messages.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
        }
        assert!(orch.locks.lock().await.is_empty());
    }
}
