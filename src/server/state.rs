//! Shared per-connection state handed to every request handler. There is no
//! process-wide mutable singleton; handlers see only this context.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::AppConfig;
use crate::events::EventBus;
use crate::lifecycle::LifecycleController;
use crate::room::RoomCoordinator;
use crate::session::SessionRegistry;
use crate::transfer::TransferEngine;

/// Topic for events not tied to any one session or room.
pub const SERVER_TOPIC: &str = "server";

/// Default room for chat clients that do not name one.
pub const DEFAULT_ROOM: &str = "main";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<TransferEngine>,
    pub rooms: Arc<RoomCoordinator>,
    pub bus: Arc<EventBus>,
    pub lifecycle: Arc<LifecycleController>,
    not_found_count: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let limits = config.limits;
        let bus = Arc::new(EventBus::new(limits.poll_queue_capacity));
        let registry = Arc::new(SessionRegistry::new(limits.max_sessions));
        let lifecycle = Arc::new(LifecycleController::new(
            config.stay_open,
            Duration::from_secs(limits.shutdown_grace_secs),
        ));
        let engine = Arc::new(TransferEngine::new(
            registry.clone(),
            bus.clone(),
            lifecycle.clone(),
            config.downloads_dir.clone(),
            limits,
        ));
        let rooms = Arc::new(RoomCoordinator::new(bus.clone(), limits.room_user_cap));

        Self {
            config: Arc::new(config),
            registry,
            engine,
            rooms,
            bus,
            lifecycle,
            not_found_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Count an unknown-path request. Repeated slug guessing is treated as
    /// probing and shuts the server down, unless running publicly.
    pub fn register_not_found(&self) {
        let count = self.not_found_count.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.limits.not_found_shutdown_threshold;
        if !self.config.public_mode && count >= threshold {
            tracing::warn!(count, "too many requests for unknown paths, shutting down");
            self.lifecycle.request_shutdown();
        }
    }

    pub fn not_found_count(&self) -> u32 {
        self.not_found_count.load(Ordering::SeqCst)
    }

    /// Poll-client staleness bound: several missed intervals.
    pub fn poll_max_idle(&self) -> Duration {
        let limits = &self.config.limits;
        Duration::from_secs(limits.poll_interval_secs * limits.poll_miss_limit as u64)
    }
}
