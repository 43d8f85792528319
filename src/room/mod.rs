//! Room coordinator: per-room rosters, renames, and chat broadcast.
//!
//! Each room's roster has exactly one writer, the mutex held inside the
//! coordinator. Broadcasts go out while that lock is held, which fixes the
//! delivery order, but delivery itself never blocks on a subscriber.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::common::AppError;
use crate::events::{Event, EventBus};

pub const MAX_USERNAME_BYTES: usize = 128;

const NAME_ADJECTIVES: &[&str] = &[
    "quiet", "brave", "gentle", "swift", "lucky", "mellow", "bright", "wary", "calm", "bold",
    "sly", "merry",
];

const NAME_NOUNS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "marmot", "puffin", "weasel", "stoat", "plover",
    "vole", "shrike",
];

/// Chat handle, unique within a room. Non-empty, ASCII-only, at most 128
/// bytes; the server is the source of truth for these rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Username(String);

impl Username {
    pub fn new(raw: impl Into<String>) -> Result<Self, AppError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(AppError::Validation("username must not be empty".to_string()));
        }
        if !raw.is_ascii() {
            return Err(AppError::Validation(
                "username must contain only ASCII characters".to_string(),
            ));
        }
        if raw.len() > MAX_USERNAME_BYTES {
            return Err(AppError::Validation(format!(
                "username must be at most {MAX_USERNAME_BYTES} bytes"
            )));
        }
        Ok(Self(raw))
    }

    /// Random two-word handle for clients that join without picking one.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let adjective = NAME_ADJECTIVES.choose(&mut rng).unwrap_or(&"quiet");
        let noun = NAME_NOUNS.choose(&mut rng).unwrap_or(&"otter");
        let digits: u16 = rng.gen_range(10..100);
        Self(format!("{adjective}-{noun}-{digits}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Room {
    users: BTreeSet<Username>,
}

impl Room {
    /// Roster as seen by `recipient`: lexicographic, excluding themself.
    fn roster_for(&self, recipient: Option<&str>) -> Vec<String> {
        self.users
            .iter()
            .filter(|user| Some(user.as_str()) != recipient)
            .map(|user| user.as_str().to_string())
            .collect()
    }
}

/// Maintains the connected-user roster per room and broadcasts room events.
pub struct RoomCoordinator {
    rooms: DashMap<String, Arc<Mutex<Room>>>,
    bus: Arc<EventBus>,
    user_cap: usize,
}

impl RoomCoordinator {
    pub fn new(bus: Arc<EventBus>, user_cap: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            bus,
            user_cap,
        }
    }

    fn room(&self, room_id: &str) -> Arc<Mutex<Room>> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::default())))
            .clone()
    }

    /// Add a user, assigning a generated username when none is supplied.
    /// Broadcasts `Joined` with each member's tailored roster.
    pub fn join(&self, room_id: &str, requested: Option<Username>) -> Result<Username, AppError> {
        let room = self.room(room_id);
        let mut room = lock_clean(&room);

        if room.users.len() >= self.user_cap {
            return Err(AppError::RoomFull);
        }

        let username = match requested {
            Some(name) => {
                if room.users.contains(&name) {
                    return Err(AppError::DuplicateUsername(name.into_string()));
                }
                name
            }
            None => loop {
                let candidate = Username::generate();
                if !room.users.contains(&candidate) {
                    break candidate;
                }
            },
        };

        room.users.insert(username.clone());
        tracing::info!(room = room_id, user = %username, "user joined");

        let joined = username.clone();
        self.bus.publish_with(room_id, |recipient| Event::Joined {
            username: joined.as_str().to_string(),
            connected_users: room.roster_for(recipient),
        });
        Ok(username)
    }

    /// Atomically swap a roster entry. The roster is untouched and nothing
    /// is broadcast when the new name is invalid or already taken.
    pub fn rename(&self, room_id: &str, old_name: &str, new_name: &str) -> Result<Username, AppError> {
        let new_username = Username::new(new_name)?;
        let room = self.room(room_id);
        let mut room = lock_clean(&room);

        let old_username = Username::new(old_name)?;
        if !room.users.contains(&old_username) {
            return Err(AppError::NotFound(format!("{old_name} is not in the room")));
        }
        if room.users.contains(&new_username) {
            return Err(AppError::DuplicateUsername(new_username.into_string()));
        }

        room.users.remove(&old_username);
        room.users.insert(new_username.clone());
        self.bus.rename_subscriber(room_id, old_name, new_name);
        tracing::info!(room = room_id, old = old_name, new = new_name, "user renamed");

        let msg = format!("{old_name} has updated their username to: {new_name}");
        self.bus
            .publish_with(room_id, |recipient| Event::StatusChanged {
                msg: msg.clone(),
                connected_users: room.roster_for(recipient),
            });
        Ok(new_username)
    }

    /// Broadcast a chat message to every member, the sender included; the
    /// sender sees its own message through the same path, never a local echo.
    pub fn send_message(&self, room_id: &str, username: &str, text: &str) -> Result<(), AppError> {
        let room = self.room(room_id);
        let room = lock_clean(&room);

        let sender = Username::new(username)?;
        if !room.users.contains(&sender) {
            return Err(AppError::NotFound(format!("{username} is not in the room")));
        }

        self.bus.publish(
            room_id,
            Event::ChatMessage {
                username: username.to_string(),
                msg: text.to_string(),
            },
        );
        Ok(())
    }

    /// Remove a user and broadcast the updated roster. The room itself is
    /// dropped once the last user leaves.
    pub fn leave(&self, room_id: &str, username: &str) {
        let Some(room) = self.rooms.get(room_id).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut room = lock_clean(&room);

        let Ok(user) = Username::new(username) else {
            return;
        };
        if !room.users.remove(&user) {
            return;
        }
        tracing::info!(room = room_id, user = username, "user left");

        self.bus.publish_with(room_id, |recipient| Event::Left {
            username: username.to_string(),
            connected_users: room.roster_for(recipient),
        });

        if room.users.is_empty() {
            drop(room);
            self.rooms.remove(room_id);
        }
    }

    /// Whether the name is free in the room (used by the username
    /// pre-flight endpoint; the rename itself re-checks under the lock).
    pub fn is_name_available(&self, room_id: &str, name: &Username) -> bool {
        match self.rooms.get(room_id) {
            Some(entry) => !lock_clean(entry.value()).users.contains(name),
            None => true,
        }
    }

    /// Full lexicographic roster, nobody excluded.
    pub fn roster(&self, room_id: &str) -> Vec<String> {
        match self.rooms.get(room_id) {
            Some(entry) => lock_clean(entry.value()).roster_for(None),
            None => Vec::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn lock_clean<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("room lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules_are_enforced() {
        assert!(Username::new("alice").is_ok());
        assert!(Username::new("").is_err());
        assert!(Username::new("日本語").is_err());
        assert!(Username::new("a".repeat(128)).is_ok());
        assert!(Username::new("a".repeat(129)).is_err());
    }

    #[test]
    fn generated_usernames_are_valid() {
        for _ in 0..32 {
            let name = Username::generate();
            assert!(Username::new(name.as_str()).is_ok());
        }
    }

    #[test]
    fn roster_excludes_the_recipient() {
        let mut room = Room::default();
        room.users.insert(Username::new("bob").unwrap());
        room.users.insert(Username::new("alice").unwrap());

        assert_eq!(room.roster_for(Some("bob")), vec!["alice"]);
        assert_eq!(room.roster_for(None), vec!["alice", "bob"]);
    }
}
