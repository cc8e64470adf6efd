//! SQLite backend with FTS5 chunk search.
//!
//! Tables:
//! - `users`, `conversations`, `messages`: the conversation log
//! - `documents`, `document_chunks`: uploaded text and its chunks
//! - `conversation_documents`: link table; `iid` preserves link order
//! - `document_chunks_fts`: FTS5 index over chunk text (BM25)
//!
//! Triggers keep the FTS index in sync on insert/delete/update.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use threadline_core::document::{
    Document, DocumentChunk, DocumentId, DocumentStatus, NewChunk, NewDocument,
};
use threadline_core::error::StorageError;
use threadline_core::message::{
    Conversation, ConversationId, ConversationMode, ConversationStatus, Message, NewMessage, Role,
    UsageMetadata,
};
use threadline_core::store::{ChunkStore, ConversationStore, DocumentStore, Page};
use threadline_core::user::User;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The production store: conversations, documents, and chunk search in one SQLite file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run migrations.
    ///
    /// `"sqlite::memory:"` gives an ephemeral database held by a single
    /// connection, so every query sees the same data.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::Storage(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        if let Some(dir) = database_dir(url) {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StorageError::Storage(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }

        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    /// Create tables, the FTS5 virtual table, and its triggers.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let steps: [(&str, &str); 12] = [
            (
                "users table",
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    user_id     TEXT PRIMARY KEY,
                    username    TEXT,
                    email       TEXT,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "conversations table",
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id              TEXT PRIMARY KEY,
                    user_id         TEXT NOT NULL REFERENCES users(user_id),
                    title           TEXT,
                    mode            TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'active',
                    total_tokens    INTEGER NOT NULL DEFAULT 0,
                    total_messages  INTEGER NOT NULL DEFAULT 0,
                    created_at      TEXT NOT NULL,
                    updated_at      TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id               TEXT PRIMARY KEY,
                    conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                    role             TEXT NOT NULL,
                    content          TEXT NOT NULL,
                    sequence_number  INTEGER NOT NULL,
                    tokens_used      INTEGER NOT NULL DEFAULT 0,
                    metadata         TEXT,
                    created_at       TEXT NOT NULL,
                    UNIQUE (conversation_id, sequence_number)
                )
                "#,
            ),
            (
                "documents table",
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id          TEXT PRIMARY KEY,
                    user_id     TEXT NOT NULL REFERENCES users(user_id),
                    filename    TEXT NOT NULL,
                    file_path   TEXT NOT NULL,
                    file_type   TEXT,
                    file_size   INTEGER NOT NULL DEFAULT 0,
                    status      TEXT NOT NULL DEFAULT 'processing',
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "conversation_documents table",
                r#"
                CREATE TABLE IF NOT EXISTS conversation_documents (
                    iid              INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                    document_id      TEXT NOT NULL REFERENCES documents(id),
                    linked_at        TEXT NOT NULL,
                    UNIQUE (conversation_id, document_id)
                )
                "#,
            ),
            (
                "document_chunks table",
                r#"
                CREATE TABLE IF NOT EXISTS document_chunks (
                    iid          INTEGER PRIMARY KEY AUTOINCREMENT,
                    id           TEXT UNIQUE NOT NULL,
                    document_id  TEXT NOT NULL REFERENCES documents(id),
                    chunk_index  INTEGER NOT NULL,
                    text         TEXT NOT NULL,
                    token_count  INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (document_id, chunk_index)
                )
                "#,
            ),
            // External-content FTS5 table; content_rowid maps to document_chunks.iid
            (
                "FTS5 table",
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS document_chunks_fts USING fts5(
                    text,
                    content='document_chunks',
                    content_rowid='iid',
                    tokenize='porter unicode61'
                )
                "#,
            ),
            (
                "insert trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS document_chunks_ai AFTER INSERT ON document_chunks BEGIN
                    INSERT INTO document_chunks_fts(rowid, text) VALUES (new.iid, new.text);
                END
                "#,
            ),
            (
                "delete trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS document_chunks_ad AFTER DELETE ON document_chunks BEGIN
                    INSERT INTO document_chunks_fts(document_chunks_fts, rowid, text)
                    VALUES ('delete', old.iid, old.text);
                END
                "#,
            ),
            (
                "update trigger",
                r#"
                CREATE TRIGGER IF NOT EXISTS document_chunks_au AFTER UPDATE ON document_chunks BEGIN
                    INSERT INTO document_chunks_fts(document_chunks_fts, rowid, text)
                    VALUES ('delete', old.iid, old.text);
                    INSERT INTO document_chunks_fts(rowid, text) VALUES (new.iid, new.text);
                END
                "#,
            ),
            (
                "conversations index",
                "CREATE INDEX IF NOT EXISTS idx_conversations_user_updated ON conversations(user_id, updated_at DESC)",
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq ON messages(conversation_id, sequence_number)",
            ),
        ];

        for (label, sql) in steps {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::MigrationFailed(format!("{label}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Build a safe FTS5 query from user text.
    ///
    /// Each word is stripped to alphanumerics, quoted, and prefix-matched.
    /// Terms are OR-joined so a chunk matching any keyword is a candidate;
    /// BM25 ranks chunks matching more of them first.
    fn sanitize_fts_query(text: &str) -> String {
        text.split_whitespace()
            .map(|w| {
                let clean: String = w
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if clean.is_empty() {
                    return String::new();
                }
                format!("\"{clean}\"*")
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    /// Lower-cased words longer than two characters, for the LIKE fallback.
    fn fallback_keywords(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| w.chars().count() > 2)
            .collect()
    }

    /// `CASE document_id WHEN ?n THEN 0 ... END`, ranking by position in the id list.
    fn link_order_case(first_param: usize, count: usize) -> String {
        let arms: Vec<String> = (0..count)
            .map(|i| format!("WHEN ?{} THEN {i}", first_param + i))
            .collect();
        format!("CASE c.document_id {} END", arms.join(" "))
    }

    fn id_placeholders(first_param: usize, count: usize) -> String {
        (0..count)
            .map(|i| format!("?{}", first_param + i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn fts_search(
        &self,
        document_ids: &[DocumentId],
        fts_query: &str,
        limit: usize,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let ids = Self::id_placeholders(3, document_ids.len());
        let order = Self::link_order_case(3, document_ids.len());
        let sql = format!(
            r#"
            SELECT c.*, bm25(document_chunks_fts) AS rank
            FROM document_chunks_fts f
            JOIN document_chunks c ON c.iid = f.rowid
            WHERE document_chunks_fts MATCH ?1
              AND c.document_id IN ({ids})
            ORDER BY rank, {order}, c.chunk_index
            LIMIT ?2
            "#
        );

        let mut query = sqlx::query(&sql).bind(fts_query).bind(limit as i64);
        for id in document_ids {
            query = query.bind(id.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("FTS5 search: {e}")))?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn like_search(
        &self,
        document_ids: &[DocumentId],
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let id_start = 2;
        let keyword_start = id_start + document_ids.len();
        let ids = Self::id_placeholders(id_start, document_ids.len());
        let order = Self::link_order_case(id_start, document_ids.len());
        let conditions: Vec<String> = (0..keywords.len())
            .map(|i| format!("lower(c.text) LIKE ?{} ESCAPE '\\'", keyword_start + i))
            .collect();
        let sql = format!(
            r#"
            SELECT c.* FROM document_chunks c
            WHERE c.document_id IN ({ids})
              AND ({})
            ORDER BY {order}, c.chunk_index
            LIMIT ?1
            "#,
            conditions.join(" OR ")
        );

        let mut query = sqlx::query(&sql).bind(limit as i64);
        for id in document_ids {
            query = query.bind(id.as_str());
        }
        for keyword in keywords {
            let escaped = keyword
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            query = query.bind(format!("%{escaped}%"));
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("LIKE search: {e}")))?;

        rows.iter().map(row_to_chunk).collect()
    }
}

/// Directory that must exist before SQLite can create the file at `url`.
fn database_dir(url: &str) -> Option<std::path::PathBuf> {
    if url.contains(":memory:") {
        return None;
    }
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    let parent = std::path::Path::new(path).parent()?;
    if parent.as_os_str().is_empty() {
        None
    } else {
        Some(parent.to_path_buf())
    }
}

fn now_string() -> String {
    timestamp(&Utc::now())
}

/// Fixed-width RFC 3339 so timestamps order correctly as text.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::QueryFailed(format!("invalid timestamp '{raw}': {e}")))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::QueryFailed(format!("{name} column: {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, StorageError> {
    raw.parse().map_err(StorageError::QueryFailed)
}

fn row_to_user(row: &SqliteRow) -> Result<User, StorageError> {
    Ok(User {
        user_id: column(row, "user_id")?,
        username: column(row, "username")?,
        email: column(row, "email")?,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
        updated_at: parse_timestamp(&column::<String>(row, "updated_at")?)?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, StorageError> {
    Ok(Conversation {
        id: ConversationId(column(row, "id")?),
        user_id: column(row, "user_id")?,
        title: column(row, "title")?,
        mode: parse_enum::<ConversationMode>(&column::<String>(row, "mode")?)?,
        status: parse_enum::<ConversationStatus>(&column::<String>(row, "status")?)?,
        total_tokens: column(row, "total_tokens")?,
        total_messages: column(row, "total_messages")?,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
        updated_at: parse_timestamp(&column::<String>(row, "updated_at")?)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StorageError> {
    let metadata: Option<String> = column(row, "metadata")?;
    let metadata = match metadata {
        Some(json) => match serde_json::from_str::<UsageMetadata>(&json) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Ignoring unreadable message metadata: {e}");
                None
            }
        },
        None => None,
    };

    Ok(Message {
        id: column(row, "id")?,
        conversation_id: ConversationId(column(row, "conversation_id")?),
        role: parse_enum::<Role>(&column::<String>(row, "role")?)?,
        content: column(row, "content")?,
        sequence_number: column(row, "sequence_number")?,
        tokens_used: column(row, "tokens_used")?,
        metadata,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StorageError> {
    Ok(Document {
        id: DocumentId(column(row, "id")?),
        user_id: column(row, "user_id")?,
        filename: column(row, "filename")?,
        file_path: column(row, "file_path")?,
        file_type: column(row, "file_type")?,
        file_size: column(row, "file_size")?,
        status: parse_enum::<DocumentStatus>(&column::<String>(row, "status")?)?,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
        updated_at: parse_timestamp(&column::<String>(row, "updated_at")?)?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<DocumentChunk, StorageError> {
    let chunk_index: i64 = column(row, "chunk_index")?;
    let token_count: i64 = column(row, "token_count")?;
    Ok(DocumentChunk {
        id: column(row, "id")?,
        document_id: DocumentId(column(row, "document_id")?),
        chunk_index: u32::try_from(chunk_index)
            .map_err(|e| StorageError::QueryFailed(format!("chunk_index: {e}")))?,
        text: column(row, "text")?,
        token_count: u32::try_from(token_count)
            .map_err(|e| StorageError::QueryFailed(format!("token_count: {e}")))?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn health_check(&self) -> Result<bool, StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("ping: {e}")))?;
        Ok(true)
    }

    async fn get_or_create_user(&self, user_id: &str) -> Result<User, StorageError> {
        let now = now_string();
        sqlx::query(
            "INSERT OR IGNORE INTO users (user_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        )
        .bind(user_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("INSERT user failed: {e}")))?;

        self.find_user(user_id)
            .await?
            .ok_or_else(|| StorageError::QueryFailed(format!("user {user_id} vanished")))
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("GET user: {e}")))?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        mode: ConversationMode,
        title: Option<String>,
    ) -> Result<Conversation, StorageError> {
        let conversation = Conversation::new(user_id, mode, title);
        let created_at = timestamp(&conversation.created_at);

        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, user_id, title, mode, status, total_tokens, total_messages, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.mode.as_str())
        .bind(conversation.status.as_str())
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("INSERT conversation failed: {e}")))?;

        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StorageError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1 AND status != 'deleted'")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("GET conversation: {e}")))?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<(Vec<Conversation>, u64), StorageError> {
        let count_row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM conversations WHERE user_id = ?1 AND status != 'deleted'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("COUNT conversations: {e}")))?;
        let total: i64 = column(&count_row, "cnt")?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM conversations
            WHERE user_id = ?1 AND status != 'deleted'
            ORDER BY updated_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(user_id)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("LIST conversations: {e}")))?;

        let conversations = rows
            .iter()
            .map(row_to_conversation)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((conversations, total.max(0) as u64))
    }

    async fn latest_active_conversation(
        &self,
        user_id: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM conversations
            WHERE user_id = ?1 AND status = 'active'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("latest conversation: {e}")))?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE conversations SET status = 'deleted', updated_at = ?2 WHERE id = ?1 AND status != 'deleted'",
        )
        .bind(id.as_str())
        .bind(now_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("DELETE conversation failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Storage(format!("Metadata serialization: {e}")))?;

        // Sequence assignment happens inside the INSERT so concurrent writers
        // cannot observe the same MAX; the UNIQUE constraint backs it up.
        let row = sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, role, content, sequence_number, tokens_used, metadata, created_at)
            SELECT ?1, ?2, ?3, ?4, COALESCE(MAX(sequence_number), 0) + 1, ?5, ?6, ?7
            FROM messages WHERE conversation_id = ?2
            RETURNING sequence_number
            "#,
        )
        .bind(&id)
        .bind(message.conversation_id.as_str())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.tokens_used)
        .bind(&metadata)
        .bind(timestamp(&created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::Conflict(format!("sequence number taken: {e}"))
            }
            _ => StorageError::Storage(format!("INSERT message failed: {e}")),
        })?;

        let sequence_number: i64 = column(&row, "sequence_number")?;

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            sequence_number,
            tokens_used: message.tokens_used,
            metadata: message.metadata,
            created_at,
        })
    }

    async fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY sequence_number ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("LIST messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn recent_messages(
        &self,
        id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE conversation_id = ?1
                ORDER BY sequence_number DESC LIMIT ?2
            ) ORDER BY sequence_number ASC
            "#,
        )
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("recent messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn message_count(&self, id: &ConversationId) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE conversation_id = ?1")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("COUNT messages: {e}")))?;

        column(&row, "cnt")
    }

    async fn record_turn(
        &self,
        id: &ConversationId,
        tokens: i64,
    ) -> Result<Conversation, StorageError> {
        let row = sqlx::query(
            r#"
            UPDATE conversations SET
                total_tokens = total_tokens + ?2,
                total_messages = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?1),
                updated_at = ?3
            WHERE id = ?1 AND status != 'deleted'
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(tokens)
        .bind(now_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("UPDATE conversation stats failed: {e}")))?;

        match row {
            Some(ref r) => row_to_conversation(r),
            None => Err(StorageError::QueryFailed(format!(
                "conversation {id} not found"
            ))),
        }
    }

    async fn link_document(
        &self,
        conversation_id: &ConversationId,
        document_id: &DocumentId,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO conversation_documents (conversation_id, document_id, linked_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(document_id.as_str())
        .bind(now_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("LINK document failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StorageError> {
        let now = Utc::now();
        let doc = Document {
            id: DocumentId::new(),
            user_id: document.user_id,
            filename: document.filename,
            file_path: document.file_path,
            file_type: document.file_type,
            file_size: document.file_size,
            status: DocumentStatus::Processing,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, user_id, filename, file_path, file_type, file_size, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(doc.id.as_str())
        .bind(&doc.user_id)
        .bind(&doc.filename)
        .bind(&doc.file_path)
        .bind(&doc.file_type)
        .bind(doc.file_size)
        .bind(doc.status.as_str())
        .bind(timestamp(&now))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Storage(format!("INSERT document failed: {e}")))?;

        Ok(doc)
    }

    async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, StorageError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(format!("GET document: {e}")))?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn set_document_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE documents SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.as_str())
            .bind(status.as_str())
            .bind(now_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Storage(format!("UPDATE document status failed: {e}")))?;

        Ok(())
    }

    async fn insert_chunks(
        &self,
        id: &DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<usize, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Storage(format!("BEGIN failed: {e}")))?;

        let count = chunks.len();
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks (id, document_id, chunk_index, text, token_count)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(id.as_str())
            .bind(i64::from(chunk.chunk_index))
            .bind(&chunk.text)
            .bind(i64::from(chunk.token_count))
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Storage(format!("INSERT chunk failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Storage(format!("COMMIT failed: {e}")))?;

        debug!("Stored {count} chunks for document {id}");
        Ok(count)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn linked_documents(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DocumentId>, StorageError> {
        let rows = sqlx::query(
            "SELECT document_id FROM conversation_documents WHERE conversation_id = ?1 ORDER BY iid",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("linked documents: {e}")))?;

        rows.iter()
            .map(|row| column::<String>(row, "document_id").map(DocumentId))
            .collect()
    }

    async fn chunks_by_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(document_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(format!("chunks by document: {e}")))?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn search_chunks(
        &self,
        document_ids: &[DocumentId],
        query: &str,
        limit: usize,
    ) -> Result<Vec<DocumentChunk>, StorageError> {
        if document_ids.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let fts_query = Self::sanitize_fts_query(query);
        if !fts_query.is_empty() {
            let hits = self.fts_search(document_ids, &fts_query, limit).await?;
            if !hits.is_empty() {
                return Ok(hits);
            }
        }

        let keywords = Self::fallback_keywords(query);
        if keywords.is_empty() {
            return Ok(vec![]);
        }
        debug!("FTS found nothing; trying substring match on {} keywords", keywords.len());
        self.like_search(document_ids, &keywords, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:", 4).await.unwrap()
    }

    async fn document_with_chunks(
        store: &SqliteStore,
        user_id: &str,
        texts: &[&str],
    ) -> DocumentId {
        store.get_or_create_user(user_id).await.unwrap();
        let doc = store
            .create_document(NewDocument {
                user_id: user_id.into(),
                filename: "notes.txt".into(),
                file_path: format!("uploads/{user_id}/notes.txt"),
                file_type: Some("txt".into()),
                file_size: 42,
            })
            .await
            .unwrap();
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, t)| NewChunk {
                chunk_index: i as u32,
                text: (*t).to_string(),
                token_count: (t.chars().count() / 4) as u32,
            })
            .collect();
        store.insert_chunks(&doc.id, chunks).await.unwrap();
        doc.id
    }

    #[tokio::test]
    async fn user_creation_is_idempotent() {
        let store = test_store().await;
        let first = store.get_or_create_user("alice").await.unwrap();
        let second = store.get_or_create_user("alice").await.unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.created_at, second.created_at);
        assert!(store.find_user("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_round_trip() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::GroundedChat, Some("Notes".into()))
            .await
            .unwrap();

        let loaded = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "alice");
        assert_eq!(loaded.mode, ConversationMode::GroundedChat);
        assert_eq!(loaded.title.as_deref(), Some("Notes"));
        assert!(loaded.is_active());
    }

    #[tokio::test]
    async fn sequence_numbers_are_gapless() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();

        for i in 0..4 {
            let msg = store
                .append_message(NewMessage::user(&conv.id, format!("message {i}")))
                .await
                .unwrap();
            assert_eq!(msg.sequence_number, i + 1);
        }

        let seqs: Vec<i64> = store
            .messages(&conv.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn assistant_metadata_round_trip() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();
        let meta = UsageMetadata {
            model: "gpt-3.5-turbo".into(),
            prompt_tokens: 12,
            completion_tokens: 8,
        };
        store
            .append_message(NewMessage::assistant(&conv.id, "Hi", 20, meta.clone()))
            .await
            .unwrap();

        let messages = store.messages(&conv.id).await.unwrap();
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].tokens_used, 20);
        assert_eq!(messages[0].metadata.as_ref(), Some(&meta));
    }

    #[tokio::test]
    async fn recent_messages_keep_ascending_order() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_message(NewMessage::user(&conv.id, format!("m{i}")))
                .await
                .unwrap();
        }

        let recent = store.recent_messages(&conv.id, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert_eq!(store.message_count(&conv.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn record_turn_accumulates_tokens_and_recounts() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();
        store
            .append_message(NewMessage::user(&conv.id, "q"))
            .await
            .unwrap();
        store
            .append_message(NewMessage::user(&conv.id, "q2"))
            .await
            .unwrap();

        let first = store.record_turn(&conv.id, 30).await.unwrap();
        assert_eq!(first.total_tokens, 30);
        assert_eq!(first.total_messages, 2);

        let second = store.record_turn(&conv.id, 12).await.unwrap();
        assert_eq!(second.total_tokens, 42);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn record_turn_on_missing_conversation_fails() {
        let store = test_store().await;
        let err = store
            .record_turn(&ConversationId::from("nope"), 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn soft_delete_hides_conversation() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();

        assert!(store.delete_conversation(&conv.id).await.unwrap());
        assert!(!store.delete_conversation(&conv.id).await.unwrap());
        assert!(store.get_conversation(&conv.id).await.unwrap().is_none());
        let (listed, total) = store
            .list_conversations("alice", Page::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn list_is_paginated_newest_first() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let conv = store
                .create_conversation("alice", ConversationMode::OpenChat, None)
                .await
                .unwrap();
            ids.push(conv.id);
        }
        // Touch the first one so it becomes the most recent.
        store.record_turn(&ids[0], 1).await.unwrap();

        let (page_one, total) = store
            .list_conversations("alice", Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page_one.len(), 2);
        assert_eq!(page_one[0].id, ids[0]);

        let (page_two, _) = store
            .list_conversations("alice", Page::new(2, 2))
            .await
            .unwrap();
        assert_eq!(page_two.len(), 1);

        let latest = store.latest_active_conversation("alice").await.unwrap();
        assert_eq!(latest.unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn linking_is_idempotent_and_ordered() {
        let store = test_store().await;
        let first = document_with_chunks(&store, "alice", &["one"]).await;
        let second = document_with_chunks(&store, "alice", &["two"]).await;
        let conv = store
            .create_conversation("alice", ConversationMode::GroundedChat, None)
            .await
            .unwrap();

        store.link_document(&conv.id, &second).await.unwrap();
        store.link_document(&conv.id, &first).await.unwrap();
        store.link_document(&conv.id, &second).await.unwrap();

        let linked = store.linked_documents(&conv.id).await.unwrap();
        assert_eq!(linked, vec![second, first]);
    }

    #[tokio::test]
    async fn document_status_updates() {
        let store = test_store().await;
        let id = document_with_chunks(&store, "alice", &["text"]).await;
        assert_eq!(
            store.get_document(&id).await.unwrap().unwrap().status,
            DocumentStatus::Processing
        );
        store
            .set_document_status(&id, DocumentStatus::Processed)
            .await
            .unwrap();
        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.file_type.as_deref(), Some("txt"));
    }

    #[tokio::test]
    async fn chunks_come_back_in_index_order() {
        let store = test_store().await;
        let id = document_with_chunks(&store, "alice", &["first", "second", "third"]).await;
        let chunks = store.chunks_by_document(&id).await.unwrap();
        let indexes: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(chunks[1].text, "second");
    }

    #[tokio::test]
    async fn duplicate_chunk_index_rolls_back_whole_batch() {
        let store = test_store().await;
        let id = document_with_chunks(&store, "alice", &[]).await;
        let chunks = vec![
            NewChunk {
                chunk_index: 0,
                text: "a".into(),
                token_count: 0,
            },
            NewChunk {
                chunk_index: 0,
                text: "b".into(),
                token_count: 0,
            },
        ];
        assert!(store.insert_chunks(&id, chunks).await.is_err());
        assert!(store.chunks_by_document(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fts_search_ranks_and_filters_by_document() {
        let store = test_store().await;
        let doc = document_with_chunks(
            &store,
            "alice",
            &[
                "The quarterly revenue grew by ten percent.",
                "Employee onboarding takes two weeks.",
                "Revenue forecasts for next quarter look strong.",
            ],
        )
        .await;
        let other = document_with_chunks(&store, "bob", &["Revenue of another company."]).await;

        let hits = store
            .search_chunks(&[doc.clone()], "revenue", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|c| c.document_id == doc));
        assert!(hits.iter().all(|c| c.document_id != other));
    }

    #[tokio::test]
    async fn fts_terms_are_or_joined() {
        let store = test_store().await;
        let doc = document_with_chunks(
            &store,
            "alice",
            &["Cats are independent.", "Dogs are loyal.", "Fish swim."],
        )
        .await;

        let hits = store
            .search_chunks(&[doc], "cats dogs", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let store = test_store().await;
        let texts: Vec<String> = (0..10).map(|i| format!("widget number {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let doc = document_with_chunks(&store, "alice", &refs).await;

        let hits = store.search_chunks(&[doc], "widget", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn like_fallback_finds_infix_matches() {
        let store = test_store().await;
        let doc = document_with_chunks(&store, "alice", &["The subcontractor signed."]).await;

        // "contract" is not a token prefix of "subcontractor", so FTS misses it.
        let hits = store.search_chunks(&[doc], "contract", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn equal_rank_hits_follow_link_order_then_chunk_index() {
        let store = test_store().await;
        let first_linked = document_with_chunks(&store, "alice", &["Refund policy applies."]).await;
        let second_linked = document_with_chunks(
            &store,
            "alice",
            &["Refund policy applies.", "Refund policy applies."],
        )
        .await;

        // Identical texts tie on BM25; link order decides, then chunk index.
        let hits = store
            .search_chunks(&[second_linked.clone(), first_linked.clone()], "refund", 5)
            .await
            .unwrap();
        let order: Vec<(DocumentId, u32)> = hits
            .iter()
            .map(|c| (c.document_id.clone(), c.chunk_index))
            .collect();
        assert_eq!(
            order,
            vec![
                (second_linked.clone(), 0),
                (second_linked, 1),
                (first_linked, 0),
            ]
        );
    }

    #[tokio::test]
    async fn like_fallback_follows_link_order() {
        let store = test_store().await;
        let a = document_with_chunks(&store, "alice", &["The subcontractor signed."]).await;
        let b = document_with_chunks(&store, "alice", &["A subcontractor quoted."]).await;

        let hits = store
            .search_chunks(&[b.clone(), a.clone()], "contract", 5)
            .await
            .unwrap();
        let docs: Vec<DocumentId> = hits.into_iter().map(|c| c.document_id).collect();
        assert_eq!(docs, vec![b, a]);
    }

    #[tokio::test]
    async fn corrupt_timestamp_is_an_error() {
        let store = test_store().await;
        store.get_or_create_user("alice").await.unwrap();
        let conv = store
            .create_conversation("alice", ConversationMode::OpenChat, None)
            .await
            .unwrap();
        sqlx::query("UPDATE conversations SET created_at = 'garbage' WHERE id = ?1")
            .bind(conv.id.as_str())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get_conversation(&conv.id).await.unwrap_err();
        assert!(matches!(err, StorageError::QueryFailed(_)));
        assert!(store.latest_active_conversation("alice").await.is_err());
    }

    #[tokio::test]
    async fn search_with_no_usable_terms_is_empty() {
        let store = test_store().await;
        let doc = document_with_chunks(&store, "alice", &["anything"]).await;
        assert!(store.search_chunks(&[doc.clone()], "?!", 5).await.unwrap().is_empty());
        assert!(store.search_chunks(&[], "anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fts_index_tracks_deletes() {
        let store = test_store().await;
        let doc = document_with_chunks(&store, "alice", &["ephemeral content"]).await;
        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?1")
            .bind(doc.as_str())
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.search_chunks(&[doc], "ephemeral", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/threadline.db").display());
        let conv_id = {
            let store = SqliteStore::new(&url, 4).await.unwrap();
            store.get_or_create_user("alice").await.unwrap();
            store
                .create_conversation("alice", ConversationMode::OpenChat, None)
                .await
                .unwrap()
                .id
        };

        let reopened = SqliteStore::new(&url, 4).await.unwrap();
        assert!(reopened.get_conversation(&conv_id).await.unwrap().is_some());
    }

    #[test]
    fn sanitize_fts_query_basic() {
        assert_eq!(
            SqliteStore::sanitize_fts_query("rust programming"),
            "\"rust\"* OR \"programming\"*"
        );
    }

    #[test]
    fn sanitize_fts_query_special_chars() {
        assert_eq!(
            SqliteStore::sanitize_fts_query("what's \"NEAR\" (x)?"),
            "\"whats\"* OR \"NEAR\"* OR \"x\"*"
        );
        assert_eq!(SqliteStore::sanitize_fts_query("  "), "");
    }

    #[test]
    fn fallback_keywords_skip_short_words() {
        assert_eq!(
            SqliteStore::fallback_keywords("Is it a Contract?"),
            vec!["contract".to_string()]
        );
    }

    #[test]
    fn database_dir_for_urls() {
        assert_eq!(
            database_dir("sqlite:///tmp/x/db.sqlite?mode=rwc"),
            Some(std::path::PathBuf::from("/tmp/x"))
        );
        assert_eq!(database_dir("sqlite::memory:"), None);
        assert_eq!(database_dir("sqlite://db.sqlite"), None);
    }
}
