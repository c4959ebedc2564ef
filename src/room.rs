//! Room lifecycle: one product view, one chat room, one connection.
//!
//! SYSTEM CONTEXT
//! ==============
//! `activate` loads the room's history first and only then opens the broker
//! connection; a failed load leaves the room `Blocked` with no connection.
//! `deactivate` releases the connection (LEAVE, DISCONNECT, task joined) and
//! discards the timeline. Switching products always completes the previous
//! teardown before the next room is loaded.
//!
//! The controller, its timeline and the connection handle live on the caller's
//! task. Connection events are folded into the timeline by `next_update`.

#[cfg(test)]
#[path = "room_test.rs"]
mod room_test;

use std::sync::Arc;

use frames::chat::ChatMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::net::api::HistorySource;
use crate::net::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::net::transport::Connector;
use crate::session::Session;
use crate::state::timeline::{Reconciled, Timeline};

/// Where the controller is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomPhase {
    /// No product view is active.
    Idle,
    /// History request in flight.
    Loading { product_id: i64 },
    /// History could not be loaded; no connection was opened.
    Blocked { product_id: i64, reason: String },
    /// History loaded and a connection manager owns the room.
    Active { product_id: i64, chat_room_id: i64 },
}

/// What changed after one connection event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomUpdate {
    Connection(ConnectionState),
    Message(Reconciled),
    BrokerError(String),
}

pub struct RoomController {
    session: Session,
    config: ChatConfig,
    history: Arc<dyn HistorySource>,
    connector: Arc<dyn Connector>,
    phase: RoomPhase,
    timeline: Timeline,
    connection: Option<ConnectionManager>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl RoomController {
    #[must_use]
    pub fn new(
        session: Session,
        config: ChatConfig,
        history: Arc<dyn HistorySource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let timeline = Timeline::new(session.user_id);
        Self {
            session,
            config,
            history,
            connector,
            phase: RoomPhase::Idle,
            timeline,
            connection: None,
            events: None,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    #[must_use]
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    #[must_use]
    pub fn chat_room_id(&self) -> Option<i64> {
        match self.phase {
            RoomPhase::Active { chat_room_id, .. } => Some(chat_room_id),
            _ => None,
        }
    }

    /// State of the room's connection, `None` when no room is active.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(ConnectionManager::state)
    }

    /// Whether sending is currently possible.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.connection_state().is_some_and(ConnectionState::is_connected)
    }

    /// Enter the chat room of `product_id`, leaving any current room first.
    ///
    /// # Errors
    ///
    /// Returns the history loader's error; the room is then `Blocked` and no
    /// connection is opened.
    pub async fn activate(&mut self, product_id: i64) -> Result<i64, ChatError> {
        self.deactivate().await;
        self.phase = RoomPhase::Loading { product_id };

        let history = match self.history.load_history(product_id, &self.session).await {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(product_id, error = %err, "chat history unavailable; room blocked");
                self.phase = RoomPhase::Blocked { product_id, reason: err.to_string() };
                return Err(err);
            }
        };

        let chat_room_id = history.chat_room_id;
        self.timeline.hydrate(history.messages);

        let (connection, events) = ConnectionManager::open(
            self.connector.clone(),
            self.config.broker.clone(),
            chat_room_id,
            self.session.clone(),
        );
        self.connection = Some(connection);
        self.events = Some(events);
        self.phase = RoomPhase::Active { product_id, chat_room_id };
        tracing::info!(product_id, room_id = chat_room_id, backlog = self.timeline.len(), "chat room activated");
        Ok(chat_room_id)
    }

    /// Append `text` optimistically and publish it as TALK.
    ///
    /// Returns the timeline index of the new entry. Rejected sends leave the
    /// timeline unchanged and are not queued.
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomUnavailable`] without an active room,
    /// [`ChatError::NotConnected`] unless connected, [`ChatError::EmptyMessage`]
    /// for blank input, [`ChatError::SendInFlight`] while an earlier send is
    /// pending.
    pub fn send(&mut self, text: &str, now: Instant) -> Result<usize, ChatError> {
        let (Some(connection), Some(chat_room_id)) = (self.connection.as_ref(), self.chat_room_id()) else {
            return Err(ChatError::RoomUnavailable);
        };
        let state = connection.state();
        if !state.is_connected() {
            return Err(ChatError::NotConnected(state));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = ChatMessage::talk(
            chat_room_id,
            self.session.user_id,
            &self.session.nickname,
            text,
            local_timestamp(),
        );
        let index = self.timeline.push_optimistic(message.clone(), now)?;
        if let Err(err) = connection.publish(message) {
            self.timeline.retract(index);
            return Err(err);
        }
        Ok(index)
    }

    /// Wait for the next connection event and fold it into the room.
    ///
    /// Returns `None` when no room is active or its connection task has ended.
    pub async fn next_update(&mut self) -> Option<RoomUpdate> {
        let event = self.events.as_mut()?.recv().await;
        let Some(event) = event else {
            self.events = None;
            return None;
        };
        let update = match event {
            ConnectionEvent::State(state) => RoomUpdate::Connection(state),
            ConnectionEvent::Message(message) => RoomUpdate::Message(self.timeline.apply_inbound(message)),
            ConnectionEvent::BrokerError { message, .. } => RoomUpdate::BrokerError(message),
        };
        Some(update)
    }

    /// Fail local sends that stayed unconfirmed past the pending timeout.
    ///
    /// Returns the timeline indices that changed.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<usize> {
        match self.config.pending_timeout {
            Some(timeout) => self.timeline.expire_pending(now, timeout),
            None => Vec::new(),
        }
    }

    /// Leave the current room, if any, and wait for its connection to close.
    pub async fn deactivate(&mut self) {
        self.events = None;
        if let Some(connection) = self.connection.take() {
            let room_id = connection.chat_room_id();
            connection.close().await;
            tracing::info!(room_id, "chat room deactivated");
        }
        self.timeline = Timeline::new(self.session.user_id);
        self.phase = RoomPhase::Idle;
    }
}

/// Client clock for optimistic sends, RFC 3339 in UTC; rendering shifts it to local time.
fn local_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
