//! HTTP surface: route table, request handlers, and the server runtime.

pub mod chat;
pub mod control;
pub mod download;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod upload;

pub use runtime::serve;
pub use state::{AppState, DEFAULT_ROOM, SERVER_TOPIC};
