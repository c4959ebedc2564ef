//! Client-local chat state.
//!
//! SYSTEM CONTEXT
//! ==============
//! `timeline` holds the ordered message view of the active room. It is owned
//! by the room controller's task and never shared across tasks.

pub mod timeline;
