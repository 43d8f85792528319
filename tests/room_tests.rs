//! Room and event-bus behavior observed the way clients observe it.

use std::sync::Arc;

use hushdrop::common::AppError;
use hushdrop::events::{Event, EventBus};
use hushdrop::room::{RoomCoordinator, Username};

const ROOM: &str = "main";

fn coordinator() -> (Arc<EventBus>, RoomCoordinator) {
    let bus = Arc::new(EventBus::new(64));
    let rooms = RoomCoordinator::new(bus.clone(), 8);
    (bus, rooms)
}

fn name(raw: &str) -> Username {
    Username::new(raw).expect("valid username")
}

fn drain(receiver: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn roster_reflects_joins_minus_leaves() {
    let (_bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("carol"))).expect("join");
    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.join(ROOM, Some(name("bob"))).expect("join");
    rooms.leave(ROOM, "carol");

    // Lexicographic order, no join-order leakage.
    assert_eq!(rooms.roster(ROOM), vec!["alice", "bob"]);
}

#[tokio::test]
async fn each_recipient_sees_a_roster_excluding_themself() {
    let (bus, rooms) = coordinator();

    let (_alice_id, mut alice_rx) = bus.subscribe_push(ROOM, Some("alice".to_string()));
    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.join(ROOM, Some(name("bob"))).expect("join");

    let events = drain(&mut alice_rx);
    let last = events.last().expect("join broadcast");
    assert_eq!(
        *last,
        Event::Joined {
            username: "bob".to_string(),
            connected_users: vec!["bob".to_string()],
        }
    );
}

#[tokio::test]
async fn duplicate_username_is_rejected_at_join() {
    let (_bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    let err = rooms
        .join(ROOM, Some(name("alice")))
        .expect_err("duplicate join");
    assert!(matches!(err, AppError::DuplicateUsername(_)));
    assert_eq!(rooms.roster(ROOM), vec!["alice"]);
}

#[tokio::test]
async fn generated_usernames_avoid_collisions() {
    let (_bus, rooms) = coordinator();

    let first = rooms.join(ROOM, None).expect("join");
    let second = rooms.join(ROOM, None).expect("join");
    assert_ne!(first, second);
    assert_eq!(rooms.roster(ROOM).len(), 2);
}

#[tokio::test]
async fn room_is_full_at_capacity() {
    let bus = Arc::new(EventBus::new(64));
    let rooms = RoomCoordinator::new(bus, 2);

    rooms.join(ROOM, Some(name("a"))).expect("join");
    rooms.join(ROOM, Some(name("b"))).expect("join");
    assert!(matches!(
        rooms.join(ROOM, Some(name("c"))),
        Err(AppError::RoomFull)
    ));
}

#[tokio::test]
async fn rename_to_taken_name_changes_nothing_and_broadcasts_nothing() {
    let (bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.join(ROOM, Some(name("bob"))).expect("join");

    let (_id, mut rx) = bus.subscribe_push(ROOM, None);
    let err = rooms
        .rename(ROOM, "alice", "bob")
        .expect_err("rename onto taken name");
    assert!(matches!(err, AppError::DuplicateUsername(_)));

    assert_eq!(rooms.roster(ROOM), vec!["alice", "bob"]);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn rename_swaps_atomically_and_announces() {
    let (bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.join(ROOM, Some(name("bob"))).expect("join");

    let (_id, mut rx) = bus.subscribe_push(ROOM, Some("bob".to_string()));
    let renamed = rooms.rename(ROOM, "alice", "alicia").expect("rename");
    assert_eq!(renamed.as_str(), "alicia");
    assert_eq!(rooms.roster(ROOM), vec!["alicia", "bob"]);

    // There is never a moment with both or neither name in the roster, so
    // the broadcast roster already shows the new name (minus the recipient).
    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![Event::StatusChanged {
            msg: "alice has updated their username to: alicia".to_string(),
            connected_users: vec!["alicia".to_string()],
        }]
    );
}

#[tokio::test]
async fn sender_receives_their_own_message_through_the_relay() {
    let (bus, rooms) = coordinator();

    let (_id, mut rx) = bus.subscribe_push(ROOM, Some("alice".to_string()));
    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.send_message(ROOM, "alice", "hello").expect("send");

    let events = drain(&mut rx);
    assert!(events.contains(&Event::ChatMessage {
        username: "alice".to_string(),
        msg: "hello".to_string(),
    }));
}

#[tokio::test]
async fn message_from_non_member_is_rejected() {
    let (_bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    assert!(rooms.send_message(ROOM, "mallory", "hi").is_err());
}

#[tokio::test]
async fn push_and_poll_subscribers_see_the_same_order() {
    let (bus, rooms) = coordinator();

    let (_push_id, mut push_rx) = bus.subscribe_push(ROOM, None);
    let poll_id = bus.subscribe_poll(ROOM, None);

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    rooms.send_message(ROOM, "alice", "one").expect("send");
    rooms.send_message(ROOM, "alice", "two").expect("send");
    rooms.leave(ROOM, "alice");

    let pushed = drain(&mut push_rx);
    let polled = bus.poll(ROOM, poll_id).expect("poll");
    assert_eq!(pushed, polled);
    assert!(matches!(pushed.first(), Some(Event::Joined { .. })));
    assert!(matches!(pushed.last(), Some(Event::Left { .. })));
}

#[tokio::test]
async fn empty_rooms_are_dropped() {
    let (_bus, rooms) = coordinator();

    rooms.join(ROOM, Some(name("alice"))).expect("join");
    assert_eq!(rooms.room_count(), 1);
    rooms.leave(ROOM, "alice");
    assert_eq!(rooms.room_count(), 0);
}
