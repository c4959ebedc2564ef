//! Network layer: REST collaborators, broker transport and the per-room
//! realtime connection.

pub mod api;
pub mod connection;
pub mod transport;
