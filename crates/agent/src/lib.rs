//! The conversation core of Threadline.
//!
//! A turn flows through:
//!
//! 1. **Persist** the user message
//! 2. **Retrieve** chunks from linked documents (grounded or linked conversations)
//! 3. **Assemble** directive + retrieved context + history within the token budget
//! 4. **Generate** via the configured provider
//! 5. **Persist** the reply and update the conversation's counters
//!
//! Uploaded documents are chunked by [`DocumentIngestor`] and linked to a
//! conversation according to the configured link policy.

pub mod context;
pub mod ingest;
pub mod pipeline;
pub mod retrieval;
pub mod runtime;
pub mod turn;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use context::{
    AssembledContext, AssemblyError, AssemblyInput, AssemblyMetadata, ContextAssembler, Directive,
    DropInfo, LayerStats, TokenBudget,
};
pub use ingest::{DocumentIngestor, IngestOutcome, PlainTextExtractor, TextExtractor, Upload};
pub use pipeline::{Clock, ContextPipeline, PrepareRequest, PreparedContext, RagSummary};
pub use retrieval::{EmptyReason, Retrieval, RetrievalSource, Retriever, RetrieverConfig, TextChunker};
pub use runtime::Runtime;
pub use turn::{GenerationSettings, StartConversation, TurnOrchestrator, TurnOutcome};
