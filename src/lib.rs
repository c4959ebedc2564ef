//! Product-inquiry chat client.
//!
//! SYSTEM CONTEXT
//! ==============
//! A buyer viewing a product talks to the seller in a chat room keyed by that
//! product. `room` drives the lifecycle: `net::api` loads the room's history,
//! `net::connection` keeps a STOMP session on the room topic, and
//! `state::timeline` reconciles optimistic sends with broker echoes. Wire
//! formats live in the `frames` crate.

pub mod config;
pub mod error;
pub mod net;
pub mod render;
pub mod room;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod test_helpers;
