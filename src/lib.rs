//! Ephemeral file sharing and chat over unguessable URLs.
//!
//! A server instance hosts sessions in one of three modes: upload (clients
//! push files in), download (clients pull the shared files), and chat
//! (relay-only messaging with no history). Sessions are single-use unless
//! marked persistent, and by default the server shuts itself down shortly
//! after its transfer completes.

pub mod common;
pub mod events;
pub mod lifecycle;
pub mod room;
pub mod server;
pub mod session;
pub mod transfer;
