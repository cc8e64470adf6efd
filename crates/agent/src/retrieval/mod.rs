//! Document chunking at upload time and chunk retrieval at turn time.

pub mod chunker;
pub mod retriever;

pub use chunker::TextChunker;
pub use retriever::{EmptyReason, Retrieval, RetrievalSource, Retriever, RetrieverConfig};
