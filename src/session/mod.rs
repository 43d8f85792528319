//! Session registry: issues ephemeral share slugs and tracks their state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::common::AppError;

const SLUG_LEN: usize = 24;

/// What a session is for; determines which operations are valid against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Clients push files to the server.
    Upload,
    /// Clients pull the listed source files, streamed in order.
    Download { sources: Vec<PathBuf> },
    /// Chat room namespace keyed by the session slug.
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Close requested while a transfer was live; applied when the transfer
    /// reaches a terminal state.
    CloseRequested,
    Closed,
}

/// One sharing instance, identified by an unguessable URL slug.
pub struct Session {
    slug: String,
    mode: SessionMode,
    persistent: bool,
    created_at: Instant,
    expires_at: Option<Instant>,
    state: RwLock<SessionState>,
    /// Transfers currently in a non-terminal state on this session.
    active_transfers: AtomicUsize,
}

impl Session {
    fn new(mode: SessionMode, persistent: bool, ttl: Option<Duration>) -> Self {
        let slug: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SLUG_LEN)
            .map(char::from)
            .collect();
        let created_at = Instant::now();
        Self {
            slug,
            mode,
            persistent,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
            state: RwLock::new(SessionState::Open),
            active_transfers: AtomicUsize::new(0),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *read_clean(&self.state)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    pub fn active_transfers(&self) -> usize {
        self.active_transfers.load(Ordering::SeqCst)
    }

    /// Record a transfer entering a non-terminal state.
    pub fn transfer_started(&self) {
        self.active_transfers.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a transfer reaching a terminal state. A deferred close is
    /// applied once the last live transfer finishes.
    pub fn transfer_finished(&self) {
        let remaining = self.active_transfers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut state = write_clean(&self.state);
            if *state == SessionState::CloseRequested {
                tracing::debug!(slug = %self.slug, "applying deferred close");
                *state = SessionState::Closed;
            }
        }
    }

    /// Mark the session closed. While a transfer is live the close is
    /// deferred so the in-flight bytes are not corrupted. Idempotent.
    pub fn close(&self) {
        let mut state = write_clean(&self.state);
        match *state {
            SessionState::Closed => {}
            _ if self.active_transfers.load(Ordering::SeqCst) > 0 => {
                *state = SessionState::CloseRequested;
            }
            _ => *state = SessionState::Closed,
        }
    }

    /// Close immediately, ignoring deferral. Used by the engine when closing
    /// a non-persistent session atomically with its completing transfer.
    pub fn close_now(&self) {
        *write_clean(&self.state) = SessionState::Closed;
    }

    /// Fail unless the session is still usable for new operations.
    pub fn check_open(&self) -> Result<(), AppError> {
        if self.is_expired() {
            return Err(AppError::Expired);
        }
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::CloseRequested | SessionState::Closed => Err(AppError::Closed),
        }
    }
}

/// Issues and validates sessions; the only owner of the session table.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Create a session with a fresh unguessable slug.
    pub fn create(
        &self,
        mode: SessionMode,
        persistent: bool,
        ttl: Option<Duration>,
    ) -> Result<Arc<Session>, AppError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(AppError::Capacity(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }
        let session = Arc::new(Session::new(mode, persistent, ttl));
        tracing::info!(slug = %session.slug(), persistent, "session created");
        self.sessions
            .insert(session.slug().to_string(), session.clone());
        Ok(session)
    }

    /// Look up a session that is still usable.
    pub fn validate(&self, slug: &str) -> Result<Arc<Session>, AppError> {
        let session = self
            .sessions
            .get(slug)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no such session: {slug}")))?;
        session.check_open()?;
        Ok(session)
    }

    /// Look up a session regardless of its state. Closed sessions remain
    /// addressable so a second attempt fails with `Closed`, not `NotFound`.
    pub fn get(&self, slug: &str) -> Result<Arc<Session>, AppError> {
        self.sessions
            .get(slug)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no such session: {slug}")))
    }

    /// Close a session by slug. Idempotent; unknown slugs error.
    pub fn close(&self, slug: &str) -> Result<(), AppError> {
        let session = self.get(slug)?;
        session.close();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn read_clean<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("session lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_clean<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("session lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_unique_and_url_safe() {
        let registry = SessionRegistry::new(8);
        let a = registry
            .create(SessionMode::Upload, false, None)
            .expect("create");
        let b = registry
            .create(SessionMode::Upload, false, None)
            .expect("create");

        assert_ne!(a.slug(), b.slug());
        assert!(a.slug().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(a.slug().len(), SLUG_LEN);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = SessionRegistry::new(1);
        registry
            .create(SessionMode::Upload, false, None)
            .expect("first create");
        let err = registry.create(SessionMode::Upload, false, None);
        assert!(matches!(err, Err(AppError::Capacity(_))));
    }

    #[test]
    fn close_is_deferred_while_a_transfer_is_live() {
        let registry = SessionRegistry::new(4);
        let session = registry
            .create(SessionMode::Upload, true, None)
            .expect("create");

        session.transfer_started();
        registry.close(session.slug()).expect("close");
        assert_eq!(session.state(), SessionState::CloseRequested);
        assert!(session.check_open().is_err());

        session.transfer_finished();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn close_twice_yields_closed_error_without_corruption() {
        let registry = SessionRegistry::new(4);
        let session = registry
            .create(SessionMode::Upload, false, None)
            .expect("create");

        registry.close(session.slug()).expect("first close");
        registry.close(session.slug()).expect("second close is a no-op");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            registry.validate(session.slug()),
            Err(AppError::Closed)
        ));
    }

    #[test]
    fn expired_sessions_fail_validation() {
        let registry = SessionRegistry::new(4);
        let session = registry
            .create(SessionMode::Upload, false, Some(Duration::ZERO))
            .expect("create");

        assert!(matches!(
            registry.validate(session.slug()),
            Err(AppError::Expired)
        ));
    }
}
