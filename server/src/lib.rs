//! PTY session broker server: wire protocol, message dispatcher, connection
//! bookkeeping, and the axum transport that carries them.

pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod web_server;

pub use web_server::{build_router, run, AppState};
