//! Chat endpoints: the WebSocket push channel and the username pre-flight.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::common::AppError;
use crate::events::Event;
use crate::room::Username;
use crate::server::state::{AppState, DEFAULT_ROOM};

/// Messages a chat client sends over the socket, decoded once here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// A new chat line.
    Text { msg: String },
    /// The user picked a new handle.
    UpdateUsername { username: String },
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    room: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    username: String,
    /// Current handle when the caller already sits in a room.
    current: Option<String>,
    room: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateUsernameResponse {
    success: bool,
    username: String,
}

/// Validate a requested username and, when the caller is already in a room,
/// apply the rename. `success: false` echoes the name still in effect.
pub async fn update_session_username(
    State(state): State<AppState>,
    Json(request): Json<UpdateUsernameRequest>,
) -> Json<UpdateUsernameResponse> {
    let room_id = request.room.as_deref().unwrap_or(DEFAULT_ROOM);

    let requested = match Username::new(request.username.clone()) {
        Ok(name) => name,
        Err(err) => {
            tracing::debug!(error = %err, "username rejected");
            return Json(UpdateUsernameResponse {
                success: false,
                username: request.current.unwrap_or(request.username),
            });
        }
    };

    match request.current {
        Some(current) => match state.rooms.rename(room_id, &current, requested.as_str()) {
            Ok(renamed) => Json(UpdateUsernameResponse {
                success: true,
                username: renamed.into_string(),
            }),
            Err(err) => {
                tracing::debug!(error = %err, "rename rejected");
                Json(UpdateUsernameResponse {
                    success: false,
                    username: current,
                })
            }
        },
        None => {
            let available = state.rooms.is_name_available(room_id, &requested);
            Json(UpdateUsernameResponse {
                success: available,
                username: requested.into_string(),
            })
        }
    }
}

/// Upgrade to the push channel. The client joins on connect and leaves when
/// the socket drops; a dropped socket broadcasts `Left` like an explicit
/// leave would.
pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ChatQuery) {
    let room_id = query.room.unwrap_or_else(|| DEFAULT_ROOM.to_string());
    let (mut sink, mut stream) = socket.split();

    let requested = match query.username.map(Username::new).transpose() {
        Ok(name) => name,
        Err(err) => {
            let _ = sink
                .send(Message::Text(status_json(&err.to_string(), Vec::new())))
                .await;
            let _ = sink.close().await;
            return;
        }
    };

    // Subscribe before joining so this client receives its own Joined
    // broadcast through the same path as everyone else.
    let explicit_name = requested.is_some();
    let (sub_id, mut bus_rx, username) = loop {
        let candidate = requested
            .clone()
            .unwrap_or_else(Username::generate);
        let (sub_id, bus_rx) = state
            .bus
            .subscribe_push(&room_id, Some(candidate.as_str().to_string()));
        match state.rooms.join(&room_id, Some(candidate.clone())) {
            Ok(joined) => break (sub_id, bus_rx, joined),
            Err(err) => {
                state.bus.unsubscribe(&room_id, sub_id);
                let retryable =
                    matches!(err, AppError::DuplicateUsername(_)) && !explicit_name;
                if !retryable {
                    let _ = sink
                        .send(Message::Text(status_json(
                            &err.to_string(),
                            state.rooms.roster(&room_id),
                        )))
                        .await;
                    let _ = sink.close().await;
                    return;
                }
            }
        }
    };

    tracing::debug!(room = %room_id, user = %username, "chat socket open");

    // Direct channel for errors addressed to this client only.
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<Event>();
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = bus_rx.recv() => event,
                event = direct_rx.recv() => event,
            };
            let Some(event) = event else { break };
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut username = username;
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut send_task => break,
        };
        let Some(Ok(message)) = message else { break };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Text { msg }) => {
                    if let Err(err) = state.rooms.send_message(&room_id, username.as_str(), &msg) {
                        tracing::debug!(error = %err, "chat message rejected");
                    }
                }
                Ok(ClientMessage::UpdateUsername { username: new_name }) => {
                    match state.rooms.rename(&room_id, username.as_str(), &new_name) {
                        Ok(renamed) => username = renamed,
                        Err(err) => {
                            let _ = direct_tx.send(Event::StatusChanged {
                                msg: err.to_string(),
                                connected_users: state.rooms.roster(&room_id),
                            });
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "unrecognized chat payload");
                    let _ = direct_tx.send(Event::StatusChanged {
                        msg: "unrecognized message".to_string(),
                        connected_users: state.rooms.roster(&room_id),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    state.bus.unsubscribe(&room_id, sub_id);
    state.rooms.leave(&room_id, username.as_str());
    tracing::debug!(room = %room_id, user = %username, "chat socket closed");
}

fn status_json(msg: &str, connected_users: Vec<String>) -> String {
    serde_json::to_string(&Event::StatusChanged {
        msg: msg.to_string(),
        connected_users,
    })
    .unwrap_or_default()
}
