//! Context assembly: directive, retrieved context, and a history window,
//! fitted to a token budget.
//!
//! | Layer | Source | Trim strategy |
//! |-------|--------|---------------|
//! | Directive | Conversation mode + clock | Never trimmed |
//! | Retrieved context | Linked document chunks | Never trimmed |
//! | History | Persisted messages | Oldest turns dropped first |

pub mod assembler;
pub mod directive;
pub mod token;

pub use assembler::{
    AssembledContext, AssemblyError, AssemblyInput, AssemblyMetadata, ContextAssembler, DropInfo,
    LayerStats, TokenBudget, render_context,
};
pub use directive::{Directive, format_timestamp};
