//! Long-poll and control endpoints: poll registration and draining,
//! heartbeat, stay-open toggles, close, and the unknown-path fallback.

use axum::extract::{Path, Query, State};
use axum::http::Uri;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::common::AppError;
use crate::events::{Event, SubscriberId};
use crate::room::Username;
use crate::server::state::{AppState, DEFAULT_ROOM, SERVER_TOPIC};
use crate::session::SessionMode;

#[derive(Debug, Serialize)]
pub struct InitInfo {
    version: &'static str,
    public_mode: bool,
    poll_interval_secs: u64,
}

pub async fn init_info(State(state): State<AppState>) -> Json<InitInfo> {
    Json(InitInfo {
        version: env!("CARGO_PKG_VERSION"),
        public_mode: state.config.public_mode,
        poll_interval_secs: state.config.limits.poll_interval_secs,
    })
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    slug: String,
    mode: &'static str,
    persistent: bool,
    filenames: Vec<String>,
}

/// Page-load probe for a session. Announces the visit on the server topic.
pub async fn session_info(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionInfo>, AppError> {
    let session = state.registry.validate(&slug)?;

    state.bus.publish(
        SERVER_TOPIC,
        Event::PageLoaded {
            path: format!("/{slug}"),
        },
    );

    let (mode, filenames) = match session.mode() {
        SessionMode::Upload => ("upload", Vec::new()),
        SessionMode::Download { sources } => (
            "download",
            sources
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
        ),
        SessionMode::Chat => ("chat", Vec::new()),
    };

    Ok(Json(SessionInfo {
        slug,
        mode,
        persistent: session.is_persistent(),
        filenames,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartPollRequest {
    pub room: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartPollResponse {
    pub client_id: String,
    pub username: Option<String>,
    pub poll_interval_secs: u64,
}

/// Register a poll client. With a username the client also joins the room;
/// the queue is registered before the join so the client's own `Joined`
/// broadcast lands in it, same as the push path.
pub async fn start_poll(
    State(state): State<AppState>,
    Json(request): Json<StartPollRequest>,
) -> Result<Json<StartPollResponse>, AppError> {
    let topic = request.room.unwrap_or_else(|| DEFAULT_ROOM.to_string());

    let (id, name) = match request.username {
        Some(raw) => {
            let requested = Username::new(raw)?;
            let id = state
                .bus
                .subscribe_poll(&topic, Some(requested.as_str().to_string()));
            match state.rooms.join(&topic, Some(requested)) {
                Ok(joined) => (id, Some(joined.into_string())),
                Err(err) => {
                    state.bus.unsubscribe(&topic, id);
                    return Err(err);
                }
            }
        }
        None => (state.bus.subscribe_poll(&topic, None), None),
    };

    Ok(Json(StartPollResponse {
        client_id: id.to_string(),
        username: name,
        poll_interval_secs: state.config.limits.poll_interval_secs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub client_id: String,
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub events: Vec<Event>,
}

pub async fn check_for_requests(
    Query(query): Query<PollQuery>,
    State(state): State<AppState>,
) -> Result<Json<PollResponse>, AppError> {
    let topic = query.room.as_deref().unwrap_or(DEFAULT_ROOM);
    let id = parse_client_id(&query.client_id)?;
    let events = state.bus.poll(topic, id)?;
    Ok(Json(PollResponse { events }))
}

pub async fn heartbeat(
    Query(query): Query<PollQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let topic = query.room.as_deref().unwrap_or(DEFAULT_ROOM);
    let id = parse_client_id(&query.client_id)?;
    state.bus.touch(topic, id)?;
    Ok(Json(serde_json::json!({ "alive": true })))
}

fn parse_client_id(raw: &str) -> Result<SubscriberId, AppError> {
    raw.parse::<SubscriberId>()
        .map_err(|_| AppError::BadRequest("malformed client id".to_string()))
}

pub async fn stay_open_true(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.lifecycle.set_stay_open(true);
    Json(serde_json::json!({ "stay_open": true }))
}

pub async fn stay_open_false(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.lifecycle.set_stay_open(false);
    Json(serde_json::json!({ "stay_open": false }))
}

#[derive(Debug, Deserialize, Default)]
pub struct CloseRequest {
    session: Option<String>,
}

/// Close one session, or with no body shut the whole server down.
pub async fn close(
    State(state): State<AppState>,
    request: Option<Json<CloseRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    match request.session {
        Some(slug) => {
            state.registry.close(&slug)?;
            Ok(Json(serde_json::json!({ "closed": slug })))
        }
        None => {
            state.lifecycle.request_shutdown();
            Ok(Json(serde_json::json!({ "shutting_down": true })))
        }
    }
}

/// Fallback for every unmatched path. Feeds the flood guard and tells
/// watching clients something probed an unknown path.
pub async fn not_found(uri: Uri, State(state): State<AppState>) -> AppError {
    state.bus.publish(
        SERVER_TOPIC,
        Event::OtherRequest {
            path: uri.path().to_string(),
        },
    );
    state.register_not_found();
    AppError::NotFound(uri.path().to_string())
}
