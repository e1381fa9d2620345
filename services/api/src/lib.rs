//! Voice Relay API Library Crate
//!
//! This library contains the web service around the voice pipeline: the
//! session registry, the three voice transports, the text relay, API handlers
//! and routing. The `api` binary is a thin wrapper around this library.

pub mod agents;
pub mod config;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod room;
pub mod router;
pub mod signaling;
pub mod state;
pub mod text_relay;
pub mod voice;
pub mod ws;
