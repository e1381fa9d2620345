//! WebSocket Transport
//!
//! Voice sessions for clients that stream audio over a plain WebSocket:
//!
//! - `protocol`: the JSON message format between the browser and the server.
//! - `session`: the connection lifecycle, from upgrade to session teardown.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
