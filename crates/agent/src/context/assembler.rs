//! Context assembly pipeline: the core architectural component.
//!
//! Builds the ordered message list for one generation call:
//!
//! 1. **Directive**: the system framing, stamped with the current time
//! 2. **Retrieved context**: document chunks under `[Context N]` labels
//! 3. **History window**: the most recent `window_size` messages
//! 4. **Truncation**: only when the estimate exceeds the budget: framing is
//!    kept whole, conversation messages are dropped oldest-first
//!
//! # Determinism
//!
//! Assembly is a pure function of its input. The directive's timestamp is
//! rendered by the caller, so identical inputs always produce identical
//! outputs.

use crate::context::token;
use serde::{Deserialize, Serialize};
use threadline_core::message::{ContextMessage, Role};
use tracing::{info, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Token budget configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Ceiling on the estimated tokens of the assembled context.
    pub total: usize,
    /// Tokens held back for the reply when truncating.
    pub response_reserve: usize,
    /// Most recent history messages kept before budgeting.
    pub window_size: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            total: 4000,
            response_reserve: 100,
            window_size: 20,
        }
    }
}

/// All inputs required by the assembler for a single generation call.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    /// Prior messages, oldest first. Includes the current user message.
    pub history: &'a [ContextMessage],
    /// Rendered directive text, if any.
    pub system_directive: Option<&'a str>,
    /// Retrieved chunk texts, in retrieval order.
    pub retrieved_chunks: &'a [String],
    /// Whether this turn was meant to be grounded.
    pub rag_enabled: bool,
}

/// The assembled context, ready for a provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    /// Ordered messages: framing first, then the conversation window.
    pub messages: Vec<ContextMessage>,
    /// Assembly metadata (token counts, drops, utilization).
    pub metadata: AssemblyMetadata,
}

/// Detailed metadata about the assembly process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Estimated tokens of the assembled messages.
    pub total_tokens: usize,
    /// Configured token budget.
    pub budget: usize,
    /// Estimated tokens of the framing (system) messages.
    pub system_tokens: usize,
    /// Budget utilization percentage.
    pub utilization_pct: f32,
    /// Whether budget truncation ran.
    pub truncated: bool,
    /// Per-layer statistics.
    pub per_layer: Vec<LayerStats>,
    /// Items dropped from each layer.
    pub drops: Vec<DropInfo>,
    /// Non-fatal conditions worth surfacing (e.g. grounded turn without chunks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Statistics for a single context layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer name.
    pub name: String,
    /// Tokens consumed by this layer.
    pub tokens: usize,
    /// Items included after trimming.
    pub items_included: usize,
    /// Total items available before trimming.
    pub items_total: usize,
}

/// Information about items dropped from a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropInfo {
    /// Which layer.
    pub layer: String,
    /// Number of items dropped.
    pub items_dropped: usize,
    /// Estimated tokens of dropped content.
    pub tokens_dropped: usize,
    /// Reason for dropping.
    pub reason: String,
}

/// Errors from context assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// Truncation left no conversation message that fits beside the framing.
    ContextOverflow { system_tokens: usize, budget: usize },
}

impl std::fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContextOverflow {
                system_tokens,
                budget,
            } => write!(
                f,
                "Context too long even after truncation: system messages use {} tokens of a {} token budget",
                system_tokens, budget
            ),
        }
    }
}

impl std::error::Error for AssemblyError {}

impl From<AssemblyError> for threadline_core::Error {
    fn from(err: AssemblyError) -> Self {
        match err {
            AssemblyError::ContextOverflow {
                system_tokens,
                budget,
            } => Self::ContextOverflow {
                system_tokens,
                budget,
            },
        }
    }
}

/// Instruction that precedes the retrieved chunks.
const CONTEXT_PREAMBLE: &str = "Use the following context from uploaded documents to answer the user's questions. \n\
If the user asks about \"the file\" or \"this file\", they are referring to the content below.\n\
Answer based on the provided context. If the context doesn't contain enough information, say so.\n\n\
Context from documents:\n";

/// Render chunks as `[Context N]\n<text>` blocks joined by blank lines.
pub fn render_context(chunks: &[String]) -> String {
    let body = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Context {}]\n{}", i + 1, chunk))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{CONTEXT_PREAMBLE}{body}")
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// The context assembler. Stateless: create one and reuse it.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    budget: TokenBudget,
}

impl ContextAssembler {
    /// Create a new assembler with the given token budget.
    pub fn new(budget: TokenBudget) -> Self {
        Self { budget }
    }

    /// Create an assembler with the default budget (4000 tokens, window 20).
    pub fn with_default_budget() -> Self {
        Self::new(TokenBudget::default())
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    /// Assemble the message sequence for one turn.
    ///
    /// # Algorithm
    ///
    /// 1. Directive message, then the retrieved-context message when chunks exist
    /// 2. Keep only the newest `window_size` history messages
    /// 3. If the estimate fits the budget, return everything unchanged
    /// 4. Otherwise keep all system messages, then walk the conversation from
    ///    newest to oldest and stop at the first message that no longer fits
    ///    in `budget - system_tokens - response_reserve`
    /// 5. No surviving conversation message → [`AssemblyError::ContextOverflow`]
    pub fn assemble(&self, input: &AssemblyInput<'_>) -> Result<AssembledContext, AssemblyError> {
        let mut stats: Vec<LayerStats> = Vec::new();
        let mut drops: Vec<DropInfo> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // ── Framing: directive + retrieved context ─────────────────────────
        let mut framing: Vec<ContextMessage> = Vec::new();

        if let Some(directive) = input.system_directive {
            let message = ContextMessage::system(directive);
            stats.push(Self::single_stats("directive", &message));
            framing.push(message);
        }

        if !input.retrieved_chunks.is_empty() {
            let message = ContextMessage::system(render_context(input.retrieved_chunks));
            stats.push(LayerStats {
                name: "retrieved_context".into(),
                tokens: token::estimate_message_tokens(&message),
                items_included: input.retrieved_chunks.len(),
                items_total: input.retrieved_chunks.len(),
            });
            framing.push(message);
        } else if input.rag_enabled {
            let note = "RAG enabled but no chunks were retrieved; answering ungrounded";
            warn!("{note}");
            warnings.push(note.into());
        }

        // ── Sliding window ─────────────────────────────────────────────────
        let window_start = input
            .history
            .len()
            .saturating_sub(self.budget.window_size);
        let (outside, window) = input.history.split_at(window_start);
        if !outside.is_empty() {
            drops.push(DropInfo {
                layer: "history".into(),
                items_dropped: outside.len(),
                tokens_dropped: token::estimate_messages_tokens(outside),
                reason: format!("Outside the {} message window", self.budget.window_size),
            });
        }

        let mut messages: Vec<ContextMessage> = framing.clone();
        messages.extend_from_slice(window);
        let total = token::estimate_messages_tokens(&messages);

        if total <= self.budget.total {
            stats.push(LayerStats {
                name: "history".into(),
                tokens: token::estimate_messages_tokens(window),
                items_included: window.len(),
                items_total: input.history.len(),
            });
            let system_tokens = messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(token::estimate_message_tokens)
                .sum();
            return Ok(self.finish(messages, system_tokens, false, stats, drops, warnings));
        }

        // ── Truncation ─────────────────────────────────────────────────────
        let (history_system, conversation): (Vec<&ContextMessage>, Vec<&ContextMessage>) =
            window.iter().partition(|m| m.role == Role::System);
        framing.extend(history_system.into_iter().cloned());

        let system_tokens = token::estimate_messages_tokens(&framing);
        let available = self
            .budget
            .total
            .saturating_sub(system_tokens)
            .saturating_sub(self.budget.response_reserve);

        let mut kept: Vec<ContextMessage> = Vec::new();
        let mut used = 0;
        for message in conversation.iter().rev() {
            let cost = token::estimate_message_tokens(message);
            if used + cost > available {
                break;
            }
            used += cost;
            kept.push((*message).clone());
        }
        kept.reverse();

        if kept.is_empty() {
            warn!(
                system_tokens,
                budget = self.budget.total,
                "Context overflow: nothing fits after truncation"
            );
            return Err(AssemblyError::ContextOverflow {
                system_tokens,
                budget: self.budget.total,
            });
        }

        let dropped = conversation.len() - kept.len();
        let dropped_tokens: usize = conversation[..dropped]
            .iter()
            .map(|m| token::estimate_message_tokens(m))
            .sum();
        info!(
            dropped,
            dropped_tokens,
            kept = kept.len(),
            budget = self.budget.total,
            "Truncated conversation history to fit token budget"
        );
        drops.push(DropInfo {
            layer: "history".into(),
            items_dropped: dropped,
            tokens_dropped: dropped_tokens,
            reason: "Oldest messages dropped to fit the token budget".into(),
        });
        stats.push(LayerStats {
            name: "history".into(),
            tokens: used,
            items_included: kept.len(),
            items_total: input.history.len(),
        });

        let mut messages = framing;
        messages.extend(kept);
        Ok(self.finish(messages, system_tokens, true, stats, drops, warnings))
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    fn finish(
        &self,
        messages: Vec<ContextMessage>,
        system_tokens: usize,
        truncated: bool,
        per_layer: Vec<LayerStats>,
        drops: Vec<DropInfo>,
        warnings: Vec<String>,
    ) -> AssembledContext {
        let total_tokens = token::estimate_messages_tokens(&messages);
        let utilization_pct = if self.budget.total == 0 {
            0.0
        } else {
            (total_tokens as f32 / self.budget.total as f32) * 100.0
        };

        AssembledContext {
            messages,
            metadata: AssemblyMetadata {
                total_tokens,
                budget: self.budget.total,
                system_tokens,
                utilization_pct,
                truncated,
                per_layer,
                drops,
                warnings,
            },
        }
    }

    fn single_stats(layer: &str, message: &ContextMessage) -> LayerStats {
        LayerStats {
            name: layer.into(),
            tokens: token::estimate_message_tokens(message),
            items_included: 1,
            items_total: 1,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
