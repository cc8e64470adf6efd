//! Users, identified by an external id supplied by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user who owns conversations and documents.
///
/// There is no authentication here; the external id is trusted and every
/// read is scoped by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            username: None,
            email: None,
            created_at: now,
            updated_at: now,
        }
    }
}
