//! Error taxonomy and the request-boundary mappings to flash JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Application error taxonomy. Every per-request failure is one of these;
/// handlers return `Result<_, AppError>` and the conversion below turns the
/// error into the wire shape the client expects.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// User-correctable input problem (bad username, filename, size).
    #[error("{0}")]
    Validation(String),

    /// Unknown session slug or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Session existed but its expiry has passed.
    #[error("session expired")]
    Expired,

    /// Session has been closed; no further transfers may start.
    #[error("session closed")]
    Closed,

    /// Configured maximum of concurrent sessions exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Configured per-room user cap hit.
    #[error("room is full")]
    RoomFull,

    /// Requested username already present in the room.
    #[error("username already taken: {0}")]
    DuplicateUsername(String),

    /// Chunk offset does not match the append position.
    #[error("out-of-order chunk: expected offset {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    /// Writing this chunk would exceed the configured maximum transfer size.
    #[error("size limit exceeded: {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    /// Transfer auto-cancelled after the configured idle period.
    #[error("transfer idle timeout")]
    IdleTimeout,

    /// Malformed request that fits no finer bucket.
    #[error("{0}")]
    BadRequest(String),

    /// Unrecoverable internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True when the client should replace the whole page rather than show
    /// a flash (the session is no longer usable at all).
    pub fn replaces_page(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_) | AppError::Expired | AppError::Closed
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Expired | AppError::Closed => StatusCode::GONE,
            AppError::Capacity(_) | AppError::RoomFull => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DuplicateUsername(_) => StatusCode::CONFLICT,
            AppError::OutOfOrder { .. } | AppError::SizeLimitExceeded { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::IdleTimeout => StatusCode::REQUEST_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body used when the session is terminally unusable: the client swaps
    /// its page for `new_body` instead of appending a flash.
    fn page_body(&self) -> String {
        match self {
            AppError::Expired => "This share link has expired.".to_string(),
            AppError::Closed => "This share is closed. Nothing more can be sent.".to_string(),
            _ => "Not found.".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(ref err) = self {
            tracing::error!(error = %err, "internal error at request boundary");
        }

        let status = self.status();
        let body = if self.replaces_page() {
            json!({ "new_body": self.page_body() })
        } else {
            json!({
                "error_flashes": [self.to_string()],
                "info_flashes": [],
            })
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_session_errors_replace_the_page() {
        assert!(AppError::Closed.replaces_page());
        assert!(AppError::Expired.replaces_page());
        assert!(AppError::NotFound("x".into()).replaces_page());
        assert!(!AppError::RoomFull.replaces_page());
        assert!(!AppError::Validation("bad".into()).replaces_page());
    }

    #[test]
    fn out_of_order_message_names_both_offsets() {
        let err = AppError::OutOfOrder {
            expected: 300_000,
            got: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("300000"));
        assert!(msg.contains("got 0"));
    }

    #[test]
    fn status_codes_distinguish_user_and_server_faults() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::Closed.status(), StatusCode::GONE);
        assert_eq!(AppError::RoomFull.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
