//! Message and Conversation domain types.
//!
//! Two message shapes flow through the system:
//! - [`Message`] is the persisted, immutable record with a per-conversation
//!   sequence number.
//! - [`ContextMessage`] is the ephemeral role/content pair the context
//!   assembler works on and the provider receives. It is never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Framing instructions (directive, retrieved context)
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A role/content pair sent to the generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Message> for ContextMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Provider accounting attached to assistant messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A persisted message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Owning conversation
    pub conversation_id: ConversationId,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Position in the conversation, gapless from 1
    pub sequence_number: i64,

    /// Total tokens reported by the provider (0 for user messages)
    pub tokens_used: i64,

    /// Usage breakdown, present only on assistant messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<UsageMetadata>,

    pub created_at: DateTime<Utc>,
}

/// A message about to be appended. The store assigns id and sequence number.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub tokens_used: i64,
    pub metadata: Option<UsageMetadata>,
}

impl NewMessage {
    /// A user message with no usage accounting.
    pub fn user(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            role: Role::User,
            content: content.into(),
            tokens_used: 0,
            metadata: None,
        }
    }

    /// An assistant reply carrying the provider's usage.
    pub fn assistant(
        conversation_id: &ConversationId,
        content: impl Into<String>,
        tokens_used: i64,
        metadata: UsageMetadata,
    ) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
            content: content.into(),
            tokens_used,
            metadata: Some(metadata),
        }
    }
}

/// Whether retrieval is mandatory for a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// General chat; retrieval only when documents are linked
    #[default]
    OpenChat,
    /// Answers grounded in linked documents
    GroundedChat,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenChat => "open_chat",
            Self::GroundedChat => "grounded_chat",
        }
    }
}

impl FromStr for ConversationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_chat" => Ok(Self::OpenChat),
            "grounded_chat" => Ok(Self::GroundedChat),
            other => Err(format!("unknown conversation mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

/// A conversation's metadata and running counters.
///
/// Messages are loaded separately through the store; the counters are
/// updated once per completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    /// External id of the owning user
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub mode: ConversationMode,

    pub status: ConversationStatus,

    /// Sum of provider-reported tokens over all turns
    pub total_tokens: i64,

    /// Number of persisted messages
    pub total_messages: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh, active conversation with zeroed counters.
    pub fn new(user_id: impl Into<String>, mode: ConversationMode, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            user_id: user_id.into(),
            title,
            mode,
            status: ConversationStatus::Active,
            total_tokens: 0,
            total_messages: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }
}
