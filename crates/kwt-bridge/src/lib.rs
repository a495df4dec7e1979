//! Bridge layer between browser clients and cluster-side exec streams.
//!
//! Key modules:
//! - [`session`] — the terminal session bridge: two pump loops plus a
//!   supervisor enforcing idle and absolute timeouts
//! - [`protocol`] — client frame classification and terminal output shaping
//! - [`upload`] — the file transfer bridge (tar over exec stdin)
//! - [`audit`] — fire-and-forget connection/upload audit sink
//! - [`api`] — Axum router, state and error mapping
//! - [`ws`] — WebSocket upgrade handler wiring a socket to a session

pub mod api;
pub mod audit;
pub mod protocol;
pub mod session;
pub mod upload;
pub mod ws;
