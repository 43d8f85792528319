//! Whole-server wiring: flood guard, auto-shutdown, and poll revocation.

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use tempfile::TempDir;

use hushdrop::common::AppConfig;
use hushdrop::events::Event;
use hushdrop::server::control::{start_poll, StartPollRequest};
use hushdrop::server::AppState;
use hushdrop::session::SessionMode;
use hushdrop::transfer::DeclaredFile;

fn state_with(tempdir: &TempDir, tweak: impl FnOnce(&mut AppConfig)) -> AppState {
    let mut config = AppConfig::default();
    config.downloads_dir = tempdir.path().to_path_buf();
    tweak(&mut config);
    AppState::new(config)
}

#[tokio::test]
async fn unknown_path_flood_trips_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |_| {});
    let threshold = state.config.limits.not_found_shutdown_threshold;

    for _ in 0..threshold - 1 {
        state.register_not_found();
    }
    assert!(!state.lifecycle.shutdown_requested());

    state.register_not_found();
    assert!(state.lifecycle.shutdown_requested());
    assert_eq!(state.not_found_count(), threshold);
}

#[tokio::test]
async fn public_mode_disables_the_flood_guard() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |config| config.public_mode = true);

    for _ in 0..100 {
        state.register_not_found();
    }
    assert!(!state.lifecycle.shutdown_requested());
}

#[tokio::test]
async fn completed_upload_shuts_the_server_down() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |config| {
        config.limits.shutdown_grace_secs = 0;
    });

    let session = state
        .registry
        .create(SessionMode::Upload, false, None)
        .expect("create session");

    let transfer = state
        .engine
        .begin_upload(
            session.slug(),
            vec![DeclaredFile {
                name: "a.txt".to_string(),
                size: Some(5),
            }],
        )
        .await
        .expect("begin upload");
    state
        .engine
        .write_chunk(transfer.id(), 0, b"hello")
        .await
        .expect("chunk");
    state
        .engine
        .complete_upload(transfer.id())
        .await
        .expect("complete");

    tokio::time::timeout(
        Duration::from_secs(2),
        state.lifecycle.shutdown_token().cancelled(),
    )
    .await
    .expect("countdown should fire");
}

#[tokio::test]
async fn stay_open_holds_the_server_after_completion() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |config| {
        config.stay_open = true;
        config.limits.shutdown_grace_secs = 0;
    });

    let session = state
        .registry
        .create(SessionMode::Upload, false, None)
        .expect("create session");
    let transfer = state
        .engine
        .begin_upload(
            session.slug(),
            vec![DeclaredFile {
                name: "a.txt".to_string(),
                size: Some(1),
            }],
        )
        .await
        .expect("begin upload");
    state
        .engine
        .write_chunk(transfer.id(), 0, b"x")
        .await
        .expect("chunk");
    state
        .engine
        .complete_upload(transfer.id())
        .await
        .expect("complete");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!state.lifecycle.shutdown_requested());
}

#[tokio::test]
async fn poll_client_receives_its_own_joined_broadcast() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |_| {});

    let Json(response) = start_poll(
        State(state.clone()),
        Json(StartPollRequest {
            room: Some("main".to_string()),
            username: Some("alice".to_string()),
        }),
    )
    .await
    .expect("start poll");

    let id = response.client_id.parse().expect("client id");
    let events = state.bus.poll("main", id).expect("poll");
    assert_eq!(
        events,
        vec![Event::Joined {
            username: "alice".to_string(),
            connected_users: Vec::new(),
        }]
    );
}

#[tokio::test]
async fn failed_join_leaves_no_poll_subscription_behind() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |_| {});

    state
        .rooms
        .join("main", Some(hushdrop::room::Username::new("alice").expect("name")))
        .expect("join");
    let before = state.bus.subscriber_count("main");

    let result = start_poll(
        State(state.clone()),
        Json(StartPollRequest {
            room: Some("main".to_string()),
            username: Some("alice".to_string()),
        }),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(state.bus.subscriber_count("main"), before);
}

#[tokio::test]
async fn stale_poll_clients_are_revoked_and_leave_their_rooms() {
    let dir = TempDir::new().expect("tempdir");
    let state = state_with(&dir, |_| {});

    let username = state
        .rooms
        .join("main", None)
        .expect("join")
        .into_string();
    let id = state
        .bus
        .subscribe_poll("main", Some(username.clone()));

    let revoked = state.bus.sweep_stale_pollers(Duration::ZERO);
    assert_eq!(revoked.len(), 1);
    let (topic, revoked_id, name) = &revoked[0];
    assert_eq!(topic, "main");
    assert_eq!(*revoked_id, id);
    assert_eq!(name.as_deref(), Some(username.as_str()));

    // Mirrors the sweeper task: a revoked poller leaves its room.
    state.rooms.leave(topic, &username);
    assert!(state.rooms.roster("main").is_empty());

    // Its queue is gone; a later poll errors instead of blocking forever.
    assert!(state.bus.poll("main", id).is_err());
}
