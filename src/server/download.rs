//! Streaming download handler.

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Response};

use crate::common::AppError;
use crate::server::state::AppState;

/// Stream the session's shared files as one attachment. No `Range`
/// support: a fresh request reopens from the start.
pub async fn download(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<Response<Body>, AppError> {
    let (transfer, cursor) = state.engine.begin_download(&slug).await?;

    let filename = transfer
        .declared_filenames()
        .first()
        .cloned()
        .unwrap_or_else(|| "download".to_string());

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        );
    if let Some(total) = transfer.total_bytes() {
        builder = builder.header(header::CONTENT_LENGTH, total);
    }

    let response = builder
        .body(Body::from_stream(cursor.into_stream()))
        .context("build download response")?;
    Ok(response)
}
