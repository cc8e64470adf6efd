//! HTTP API v1.
//!
//! Endpoints (nested under `/api/v1`):
//!
//! - `POST   /conversations`: Create a conversation with its first message
//! - `GET    /conversations`: List a user's conversations (paginated)
//! - `GET    /conversations/{id}`: Conversation detail with messages
//! - `DELETE /conversations/{id}`: Soft delete
//! - `POST   /conversations/{id}/messages`: Send a message, get the reply
//! - `POST   /conversations/{id}/context`: Preview the assembled context
//! - `POST   /documents`: Upload a document (raw body)
//! - `GET    /documents/{id}`: Document metadata

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use threadline_agent::{
    AssemblyMetadata, Directive, RagSummary, Runtime, StartConversation, TurnOutcome, Upload,
};
use threadline_core::document::{Document, DocumentId};
use threadline_core::message::{
    ContextMessage, Conversation, ConversationId, ConversationMode, Message,
};
use threadline_core::store::{ConversationStore, DocumentStore, Page};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub runtime: Runtime,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedApiState = Arc<ApiV1State>;

const MAX_PAGE_LIMIT: u32 = 100;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/api/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route(
            "/conversations",
            post(create_conversation_handler).get(list_conversations_handler),
        )
        .route(
            "/conversations/{id}",
            get(get_conversation_handler).delete(delete_conversation_handler),
        )
        .route("/conversations/{id}/messages", post(send_message_handler))
        .route("/conversations/{id}/context", post(context_preview_handler))
        .route("/documents", post(upload_document_handler))
        .route("/documents/{id}", get(get_document_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub user_id: String,
    pub first_message: String,
    #[serde(default)]
    pub mode: ConversationMode,
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

/// The reply to a turn.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub conversation_id: ConversationId,
    pub message_id: String,
    pub message: String,
    pub tokens_used: u32,
    pub total_tokens: i64,
    pub rag: RagSummary,
}

impl From<TurnOutcome> for TurnResponse {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            conversation_id: outcome.conversation.id,
            message_id: outcome.assistant_message.id,
            message: outcome.assistant_message.content,
            tokens_used: outcome.tokens_used,
            total_tokens: outcome.total_tokens,
            rag: outcome.rag,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationDetailResponse {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextPreviewResponse {
    pub directive: Directive,
    pub messages: Vec<ContextMessage>,
    pub metadata: AssemblyMetadata,
    pub rag: RagSummary,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub user_id: String,
    pub filename: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub document: Document,
    pub chunk_count: usize,
    pub linked_conversation_id: Option<ConversationId>,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn create_conversation_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<TurnResponse>), ApiError> {
    info!(user_id = %payload.user_id, mode = payload.mode.as_str(), "v1 create conversation");

    let outcome = state
        .runtime
        .orchestrator
        .start_conversation(StartConversation {
            user_id: payload.user_id,
            first_message: payload.first_message,
            mode: payload.mode,
            document_ids: payload.document_ids,
            title: payload.title,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn list_conversations_handler(
    State(state): State<SharedApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    if query.page < 1 {
        return Err(ApiError::invalid_input("page must be at least 1"));
    }
    if !(1..=MAX_PAGE_LIMIT).contains(&query.limit) {
        return Err(ApiError::invalid_input(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }

    let store = &state.runtime.store;
    if store
        .find_user(&query.user_id)
        .await
        .map_err(threadline_core::Error::from)?
        .is_none()
    {
        return Err(threadline_core::Error::UserNotFound(query.user_id.clone()).into());
    }

    let page = Page::new(query.page, query.limit);
    let (conversations, total) = store
        .list_conversations(&query.user_id, page)
        .await
        .map_err(threadline_core::Error::from)?;

    Ok(Json(ConversationListResponse {
        conversations,
        pagination: Pagination {
            page: page.page,
            limit: page.limit,
            total,
            pages: page.page_count(total),
        },
    }))
}

async fn get_conversation_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let id = ConversationId(id);
    let store = &state.runtime.store;
    let conversation = store
        .get_conversation(&id)
        .await
        .map_err(threadline_core::Error::from)?
        .ok_or_else(|| threadline_core::Error::ConversationNotFound(id.to_string()))?;
    let messages = store
        .messages(&id)
        .await
        .map_err(threadline_core::Error::from)?;

    Ok(Json(ConversationDetailResponse {
        conversation,
        messages,
    }))
}

async fn delete_conversation_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = ConversationId(id);
    let deleted = state
        .runtime
        .store
        .delete_conversation(&id)
        .await
        .map_err(threadline_core::Error::from)?;
    if !deleted {
        return Err(threadline_core::Error::ConversationNotFound(id.to_string()).into());
    }
    info!(conversation_id = %id, "Conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<(StatusCode, Json<TurnResponse>), ApiError> {
    let outcome = state
        .runtime
        .orchestrator
        .send_message(&ConversationId(id), &payload.content)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

async fn context_preview_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<ContextPreviewResponse>, ApiError> {
    let prepared = state
        .runtime
        .orchestrator
        .preview_context(&ConversationId(id), &payload.content)
        .await?;

    Ok(Json(ContextPreviewResponse {
        directive: prepared.directive,
        messages: prepared.context.messages,
        metadata: prepared.context.metadata,
        rag: prepared.rag,
    }))
}

async fn upload_document_handler(
    State(state): State<SharedApiState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let outcome = state
        .runtime
        .ingestor
        .ingest(Upload {
            user_id: query.user_id,
            filename: query.filename,
            bytes: body.to_vec(),
            conversation_id: query.conversation_id.map(ConversationId),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            document: outcome.document,
            chunk_count: outcome.chunk_count,
            linked_conversation_id: outcome.linked_conversation,
        }),
    ))
}

async fn get_document_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    let id = DocumentId(id);
    state
        .runtime
        .store
        .get_document(&id)
        .await
        .map_err(threadline_core::Error::from)?
        .map(Json)
        .ok_or_else(|| threadline_core::Error::DocumentNotFound(id.to_string()).into())
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorBody;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use threadline_agent::test_helpers::ScriptedProvider;
    use threadline_config::AppConfig;
    use threadline_core::document::DocumentStatus;
    use threadline_core::error::ProviderError;
    use threadline_core::provider::Provider;
    use threadline_storage::InMemoryStore;
    use tower::ServiceExt;

    fn test_api_state(provider: Arc<dyn Provider>) -> SharedApiState {
        test_api_state_with(provider, AppConfig::default())
    }

    fn test_api_state_with(provider: Arc<dyn Provider>, config: AppConfig) -> SharedApiState {
        let runtime = Runtime::new(&config, Arc::new(InMemoryStore::new()), provider);
        Arc::new(ApiV1State {
            runtime,
            start_time: chrono::Utc::now(),
        })
    }

    fn mock() -> Arc<dyn Provider> {
        Arc::new(ScriptedProvider::replying("Mock reply"))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn read<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn create(state: &SharedApiState, user: &str, message: &str) -> TurnResponse {
        let response = v1_router(state.clone())
            .oneshot(json_request(
                "POST",
                "/conversations",
                serde_json::json!({"user_id": user, "first_message": message}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        read(response).await
    }

    #[tokio::test]
    async fn create_conversation_returns_reply_and_tokens() {
        let state = test_api_state(mock());
        let created = create(&state, "alice", "Hello").await;

        assert!(!created.conversation_id.as_str().is_empty());
        assert_eq!(created.message, "Mock reply");
        assert_eq!(created.tokens_used, 15);
        assert_eq!(created.total_tokens, 15);
        assert!(!created.rag.enabled);
    }

    #[tokio::test]
    async fn follow_up_accumulates_and_detail_lists_messages() {
        let state = test_api_state(mock());
        let created = create(&state, "alice", "Hello").await;
        let id = created.conversation_id.as_str().to_string();

        let response = v1_router(state.clone())
            .oneshot(json_request(
                "POST",
                &format!("/conversations/{id}/messages"),
                serde_json::json!({"content": "And again"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let turn: TurnResponse = read(response).await;
        assert_eq!(turn.total_tokens, 30);

        let response = v1_router(state)
            .oneshot(get(&format!("/conversations/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: ConversationDetailResponse = read(response).await;
        assert_eq!(detail.conversation.total_messages, 4);
        let seqs: Vec<i64> = detail.messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn list_conversations_paginates() {
        let state = test_api_state(mock());
        for i in 0..3 {
            create(&state, "alice", &format!("hello {i}")).await;
        }

        let response = v1_router(state)
            .oneshot(get("/conversations?user_id=alice&page=2&limit=2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: ConversationListResponse = read(response).await;
        assert_eq!(list.conversations.len(), 1);
        assert_eq!(list.pagination.total, 3);
        assert_eq!(list.pagination.pages, 2);
    }

    #[tokio::test]
    async fn list_validates_limit_and_user() {
        let state = test_api_state(mock());
        create(&state, "alice", "hi").await;

        let response = v1_router(state.clone())
            .oneshot(get("/conversations?user_id=alice&limit=101"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = v1_router(state)
            .oneshot(get("/conversations?user_id=nobody"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_conversation_is_404_with_code() {
        let state = test_api_state(mock());
        let response = v1_router(state)
            .oneshot(json_request(
                "POST",
                "/conversations/missing/messages",
                serde_json::json!({"content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = read(response).await;
        assert_eq!(body.code, "not_found");
    }

    #[tokio::test]
    async fn delete_hides_conversation() {
        let state = test_api_state(mock());
        let created = create(&state, "alice", "Hello").await;
        let uri = format!("/conversations/{}", created.conversation_id);

        let delete = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .body(Body::empty())
            .unwrap();
        let response = v1_router(state.clone()).oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = v1_router(state).oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rate_limited_provider_maps_to_429() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            ProviderError::RateLimited {
                retry_after_secs: 12,
            },
        )]));
        let state = test_api_state(provider);
        let response = v1_router(state)
            .oneshot(json_request(
                "POST",
                "/conversations",
                serde_json::json!({"user_id": "alice", "first_message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "12");
    }

    #[tokio::test]
    async fn unavailable_provider_maps_to_503() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            ProviderError::ServiceUnavailable("connection refused".into()),
        )]));
        let response = v1_router(test_api_state(provider))
            .oneshot(json_request(
                "POST",
                "/conversations",
                serde_json::json!({"user_id": "alice", "first_message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn overflow_maps_to_400() {
        let mut config = AppConfig::default();
        config.context.token_budget = 60;
        config.context.response_reserve = 10;
        let response = v1_router(test_api_state_with(mock(), config))
            .oneshot(json_request(
                "POST",
                "/conversations",
                serde_json::json!({"user_id": "alice", "first_message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = read(response).await;
        assert_eq!(body.code, "context_overflow");
        assert!(body.error.contains("start a new conversation"));
    }

    #[tokio::test]
    async fn upload_links_and_grounds_next_turn() {
        let state = test_api_state(mock());
        let created = create(&state, "alice", "Hello").await;

        let upload = Request::builder()
            .method("POST")
            .uri("/documents?user_id=alice&filename=policy.txt")
            .body(Body::from("Refunds are processed within fourteen days."))
            .unwrap();
        let response = v1_router(state.clone()).oneshot(upload).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let uploaded: UploadResponse = read(response).await;
        assert_eq!(uploaded.document.status, DocumentStatus::Processed);
        assert_eq!(uploaded.chunk_count, 1);
        assert_eq!(
            uploaded.linked_conversation_id.as_ref(),
            Some(&created.conversation_id)
        );

        let response = v1_router(state.clone())
            .oneshot(get(&format!("/documents/{}", uploaded.document.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = v1_router(state)
            .oneshot(json_request(
                "POST",
                &format!("/conversations/{}/context", created.conversation_id),
                serde_json::json!({"content": "How are refunds processed?"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let preview: ContextPreviewResponse = read(response).await;
        assert_eq!(preview.directive, Directive::Grounded);
        assert!(preview.rag.enabled);
        assert!(preview.messages[1].content.contains("fourteen days"));
    }

    #[tokio::test]
    async fn empty_message_is_422() {
        let state = test_api_state(mock());
        let created = create(&state, "alice", "Hello").await;
        let response = v1_router(state)
            .oneshot(json_request(
                "POST",
                &format!("/conversations/{}/messages", created.conversation_id),
                serde_json::json!({"content": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
