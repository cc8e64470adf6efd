//! Domain errors as HTTP responses.
//!
//! Every body is `{"error": "...", "code": "..."}`.

use axum::http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use threadline_core::error::{Error, ErrorKind, ProviderError};
use tracing::error;

/// Message returned for context overflow.
pub const OVERFLOW_MESSAGE: &str =
    "Context too long even after truncation. Please start a new conversation.";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// An error leaving the API.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_input", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// The language model is rate limiting us.
    pub fn rate_limited(retry_after_secs: u64, message: impl Into<String>) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
        }
    }

    /// This client exceeded the gateway's own request budget.
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                "Too many requests. Please retry later.",
            )
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err.kind() {
            ErrorKind::ContextOverflow => {
                Self::new(StatusCode::BAD_REQUEST, "context_overflow", OVERFLOW_MESSAGE)
            }
            ErrorKind::RateLimited => {
                let secs = match &err {
                    Error::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                        *retry_after_secs
                    }
                    _ => 5,
                };
                Self::rate_limited(secs, format!("The language model is rate limited: {err}"))
            }
            ErrorKind::ServiceUnavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                format!("The language model is unavailable: {err}"),
            ),
            ErrorKind::NotFound => Self::not_found(err.to_string()),
            ErrorKind::InvalidInput => Self::invalid_input(err.to_string()),
            ErrorKind::Internal => {
                error!(error = %err, "Request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(ErrorBody {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
