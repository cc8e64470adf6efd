//! The context pipeline: retrieval, directive, and assembly for one turn.
//!
//! This is the operation the turn orchestrator calls before generation.
//! It performs no writes.

use crate::context::{AssembledContext, AssemblyInput, ContextAssembler, Directive};
use crate::retrieval::{Retrieval, RetrievalSource, Retriever};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use threadline_core::message::{ContextMessage, ConversationId, ConversationMode};
use tracing::debug;

/// Source of "now" for the directive timestamp.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything needed to prepare one turn's context.
#[derive(Debug, Clone, Copy)]
pub struct PrepareRequest<'a> {
    pub conversation_id: &'a ConversationId,
    /// Conversation history, oldest first, ending with the new user message.
    pub history: &'a [ContextMessage],
    pub mode: ConversationMode,
    /// The user's newest message, used as the retrieval query.
    pub query: &'a str,
    pub linked_documents_present: bool,
}

/// How retrieval contributed to a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagSummary {
    pub enabled: bool,
    pub chunks_used: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RetrievalSource>,
}

/// The prepared context plus what went into it.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    pub context: AssembledContext,
    pub directive: Directive,
    /// `None` when retrieval was not attempted.
    pub retrieval: Option<Retrieval>,
    pub rag: RagSummary,
}

/// Retrieval and assembly wired together.
pub struct ContextPipeline {
    retriever: Arc<Retriever>,
    assembler: ContextAssembler,
    utc_offset_minutes: i32,
    clock: Clock,
}

impl ContextPipeline {
    pub fn new(retriever: Arc<Retriever>, assembler: ContextAssembler, utc_offset_minutes: i32) -> Self {
        Self {
            retriever,
            assembler,
            utc_offset_minutes,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock (tests pin it for deterministic directives).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Retrieve (when enabled), render the directive, and assemble.
    ///
    /// Retrieval runs for grounded conversations and for any conversation
    /// with linked documents. Only [`threadline_core::Error::ContextOverflow`]
    /// can come back as an error.
    pub async fn prepare_context(
        &self,
        request: PrepareRequest<'_>,
    ) -> Result<PreparedContext, threadline_core::Error> {
        let rag_enabled =
            request.mode == ConversationMode::GroundedChat || request.linked_documents_present;

        let retrieval = if rag_enabled {
            Some(
                self.retriever
                    .retrieve(request.conversation_id, request.query)
                    .await,
            )
        } else {
            None
        };
        let chunks = retrieval.as_ref().map(Retrieval::texts).unwrap_or_default();

        let directive = Directive::for_turn(request.mode, rag_enabled);
        let directive_text = directive.render((self.clock)(), self.utc_offset_minutes);

        let context = self.assembler.assemble(&AssemblyInput {
            history: request.history,
            system_directive: Some(&directive_text),
            retrieved_chunks: &chunks,
            rag_enabled,
        })?;

        debug!(
            conversation_id = %request.conversation_id,
            rag_enabled,
            chunks = chunks.len(),
            tokens = context.metadata.total_tokens,
            "Context prepared"
        );

        Ok(PreparedContext {
            rag: RagSummary {
                enabled: rag_enabled,
                chunks_used: chunks.len(),
                source: retrieval.as_ref().and_then(Retrieval::source),
            },
            context,
            directive,
            retrieval,
        })
    }
}
