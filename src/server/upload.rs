//! Multipart upload handlers for the `file[]` form.

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::response::Redirect;
use axum::Json;

use crate::common::{AppError, Flashes};
use crate::server::state::AppState;
use crate::transfer::Transfer;

use std::sync::Arc;
use uuid::Uuid;

/// Ajax upload: flashes come back as JSON for in-page display.
pub async fn upload_ajax(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Flashes>, AppError> {
    let flashes = process_upload(&state, &slug, multipart).await?;
    Ok(Json(flashes))
}

/// Form upload: same processing, then a redirect back to the session page.
pub async fn upload(
    Path(slug): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Redirect, AppError> {
    let flashes = process_upload(&state, &slug, multipart).await?;
    for msg in &flashes.error_flashes {
        tracing::warn!(slug, msg, "upload flash");
    }
    Ok(Redirect::to(&format!("/{slug}")))
}

/// Drive one multipart submission through the engine. The whole batch is a
/// single transfer; per-file problems become flash entries in the order
/// encountered and never abort the files that already streamed cleanly.
async fn process_upload(
    state: &AppState,
    slug: &str,
    mut multipart: Multipart,
) -> Result<Flashes, AppError> {
    let transfer = state.engine.begin_upload(slug, Vec::new()).await?;
    let id = transfer.id();
    let mut flashes = Flashes::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                tracing::info!(transfer = %id, error = %err, "upload aborted by client");
                let _ = state.engine.cancel(id).await;
                return Err(AppError::BadRequest("upload aborted".to_string()));
            }
        };

        let Some(filename) = field.file_name().map(ToString::to_string) else {
            continue;
        };
        if filename.is_empty() {
            continue;
        }

        match stream_field(state, id, &transfer, &filename, field).await {
            Ok(()) => {}
            Err(FieldOutcome::Rejected(err)) => {
                flashes.error(err.to_string());
            }
            Err(FieldOutcome::BatchOver(err)) => {
                flashes.error(err.to_string());
                break;
            }
            Err(FieldOutcome::Aborted) => {
                let _ = state.engine.cancel(id).await;
                return Err(AppError::BadRequest("upload aborted".to_string()));
            }
            Err(FieldOutcome::Fatal(err)) => {
                let _ = state.engine.cancel(id).await;
                return Err(err);
            }
        }
    }

    if transfer.bytes_transferred() == 0 {
        let _ = state.engine.cancel(id).await;
        flashes.info("No files uploaded");
        return Ok(flashes);
    }

    let saved = state.engine.complete_upload(id).await?;
    for name in saved {
        flashes.info(format!("Sent {name}"));
    }
    Ok(flashes)
}

enum FieldOutcome {
    /// This file was rejected; the rest of the batch continues.
    Rejected(AppError),
    /// The batch cannot take more bytes; finish with what streamed so far.
    BatchOver(AppError),
    /// The client went away mid-stream; treat as cancellation.
    Aborted,
    Fatal(AppError),
}

async fn stream_field(
    state: &AppState,
    id: Uuid,
    transfer: &Arc<Transfer>,
    filename: &str,
    mut field: Field<'_>,
) -> Result<(), FieldOutcome> {
    match state.engine.open_file(id, filename).await {
        Ok(_) => {}
        Err(err @ AppError::Internal(_)) => return Err(FieldOutcome::Fatal(err)),
        Err(err) => return Err(FieldOutcome::Rejected(err)),
    }

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                let offset = transfer.bytes_transferred();
                match state.engine.write_chunk(id, offset, &chunk).await {
                    Ok(_) => {}
                    Err(err @ AppError::SizeLimitExceeded { .. }) => {
                        return Err(FieldOutcome::BatchOver(err));
                    }
                    Err(err) => return Err(FieldOutcome::Fatal(err)),
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::debug!(transfer = %id, error = %err, "field stream broke");
                return Err(FieldOutcome::Aborted);
            }
        }
    }
}
