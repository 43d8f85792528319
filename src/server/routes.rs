//! Route table and security-header middleware.

use axum::extract::DefaultBodyLimit;
use axum::http::header::{self, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::server::state::AppState;
use crate::server::{chat, control, download, upload};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/init_info", get(control::init_info))
        .route("/start_poll", post(control::start_poll))
        .route("/check_for_requests", get(control::check_for_requests))
        .route("/heartbeat", post(control::heartbeat))
        .route("/stay_open_true", post(control::stay_open_true))
        .route("/stay_open_false", post(control::stay_open_false))
        .route("/close", post(control::close))
        .route(
            "/update-session-username",
            post(chat::update_session_username),
        )
        .route("/chat", get(chat::chat_socket))
        .route("/:slug", get(control::session_info))
        .route("/:slug/upload", post(upload::upload))
        .route("/:slug/upload-ajax", post(upload::upload_ajax))
        .route("/:slug/download", get(download::download))
        .fallback(control::not_found)
        // Transfer size is enforced per session, not by the framework.
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Headers every response carries, matching what a hardened share server
/// is expected to send.
async fn security_headers(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(header::SERVER, HeaderValue::from_static("hushdrop"));
    response
}
