//! Realtime broker connection for one chat room.
//!
//! The `ConnectionManager` owns exactly one STOMP session scoped to one room:
//! handshake, topic subscription, ENTER on connect, publish, heart-beats,
//! reconnection with capped exponential backoff, and LEAVE on teardown.
//!
//! SYSTEM CONTEXT
//! ==============
//! The socket loop runs on its own tokio task. The owning room controller
//! talks to it only through channels: commands in, [`ConnectionEvent`]s out,
//! plus a `watch` channel mirroring [`ConnectionState`]. The task never touches
//! the timeline.
//!
//! ERROR HANDLING
//! ==============
//! Transport loss, handshake failure and heart-beat silence all end the
//! current session and feed the reconnect loop. Malformed frames, foreign
//! subscriptions and broker ERROR frames are logged and skipped without
//! tearing the session down.

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::sync::Arc;
use std::time::Duration;

use frames::chat::{ChatMessage, decode_chat_message};
use frames::{Command, Decoded, Frame, FrameDecoder, HEARTBEAT, HeartBeat, encode_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::transport::{Connector, Transport};
use crate::config::BrokerConfig;
use crate::error::ChatError;
use crate::session::Session;

/// Upper bound on the farewell (LEAVE + DISCONNECT + close) during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Missed heart-beat windows tolerated before the transport is declared dead.
const HEARTBEAT_TOLERANCE: u32 = 2;

/// Lifecycle of one room connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no attempt made yet.
    #[default]
    Disconnected,
    /// First handshake in progress.
    Connecting,
    /// Handshake done; subscribed and ENTER published.
    Connected,
    /// Lost or failed; waiting for, or running, reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Terminal until closed.
    Failed,
    /// Torn down by the owner. Terminal.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// No further transitions except to `Closed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => f.write_str("failed"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Notification from the connection task to the room controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    /// A validated message from this room's topic, in broker delivery order.
    Message(ChatMessage),
    /// The broker sent an ERROR frame. Informational.
    BrokerError { message: String, details: String },
}

#[derive(Debug)]
enum Request {
    Publish(ChatMessage),
    Close,
}

/// Handle to the connection task of one room.
///
/// Dropping the handle requests teardown without waiting for it; prefer
/// [`ConnectionManager::close`] when the next room must not start until this
/// one is fully released.
#[derive(Debug)]
pub struct ConnectionManager {
    chat_room_id: i64,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start connecting to the broker for `chat_room_id`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(
        connector: Arc<dyn Connector>,
        broker: BrokerConfig,
        chat_room_id: i64,
        session: Session,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            connector,
            subscription_id: format!("sub-room-{chat_room_id}"),
            broker,
            chat_room_id,
            session,
            events: events_tx,
            state: state_tx,
        };
        let task = tokio::spawn(driver.run(requests_rx));

        let manager = Self {
            chat_room_id,
            requests: requests_tx,
            state: state_rx,
            task: Some(task),
        };
        (manager, events_rx)
    }

    #[must_use]
    pub fn chat_room_id(&self) -> i64 {
        self.chat_room_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue `message` for publication to the application destination.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConnected`] unless the session is currently
    /// connected.
    pub fn publish(&self, message: ChatMessage) -> Result<(), ChatError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(ChatError::NotConnected(state));
        }
        self.requests
            .send(Request::Publish(message))
            .map_err(|_| ChatError::NotConnected(ConnectionState::Closed))
    }

    /// Tear down: LEAVE (best-effort, if connected), release the transport,
    /// and wait for the connection task to finish.
    pub async fn close(mut self) {
        let _ = self.requests.send(Request::Close);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(room_id = self.chat_room_id, error = %err, "connection task ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.requests.send(Request::Close);
        }
    }
}

/// Why a connected session ended.
enum Exit {
    Closed,
    Lost(ChatError),
}

/// A handshaken STOMP session.
struct Link {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    heart_beat: HeartBeat,
}

struct Driver {
    connector: Arc<dyn Connector>,
    broker: BrokerConfig,
    chat_room_id: i64,
    session: Session,
    subscription_id: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let room_id = self.chat_room_id;
        let mut attempt: u32 = 0;

        loop {
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            let established = tokio::select! {
                result = self.establish() => result,
                () = wait_for_close(&mut requests) => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
            };

            match established {
                Ok(mut link) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(room_id, heart_beat = %link.heart_beat.header_value(), "chat broker connected");
                    match self.serve(&mut link, &mut requests).await {
                        Exit::Closed => {
                            self.set_state(ConnectionState::Closed);
                            tracing::info!(room_id, "chat connection closed");
                            return;
                        }
                        Exit::Lost(err) => {
                            tracing::warn!(room_id, error = %err, "chat connection lost");
                            let _ = tokio::time::timeout(CLOSE_GRACE, link.transport.close()).await;
                        }
                    }
                }
                Err(err) if !err.retryable() => {
                    tracing::error!(room_id, error = %err, "chat broker unreachable; not retrying");
                    self.give_up(&mut requests).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(room_id, attempt, error = %err, "chat broker connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            if self.broker.reconnect.exhausted(attempt) {
                tracing::error!(room_id, attempts = attempt - 1, "giving up on chat broker");
                self.give_up(&mut requests).await;
                return;
            }

            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = self.broker.reconnect.delay_for(attempt);
            tracing::debug!(room_id, attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wait_for_close(&mut requests) => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
            }
        }
    }

    async fn give_up(&self, requests: &mut mpsc::UnboundedReceiver<Request>) {
        self.set_state(ConnectionState::Failed);
        wait_for_close(requests).await;
        self.set_state(ConnectionState::Closed);
    }

    /// Open the transport and complete the CONNECT/CONNECTED exchange within
    /// the configured deadline.
    async fn establish(&self) -> Result<Link, ChatError> {
        tokio::time::timeout(self.broker.connect_timeout, self.handshake())
            .await
            .map_err(|_| ChatError::Timeout("broker handshake"))?
    }

    async fn handshake(&self) -> Result<Link, ChatError> {
        let mut transport = self.connector.connect(&self.broker.url).await?;

        let mut connect = Frame::connect(self.broker.host(), self.broker.heart_beat);
        if let Some(bearer) = self.session.bearer() {
            connect = connect.with_header("Authorization", bearer);
        }
        transport.send(encode_frame(&connect)).await?;

        let mut decoder = FrameDecoder::default();
        loop {
            let Some(text) = transport.recv().await else {
                return Err(ChatError::Closed);
            };
            let text = text?;
            for item in decoder.push(text.as_bytes()) {
                match item {
                    Ok(Decoded::Frame(frame)) if frame.command == Command::Connected => {
                        let server = frame
                            .header("heart-beat")
                            .and_then(HeartBeat::parse)
                            .unwrap_or_default();
                        let heart_beat = self.broker.heart_beat.negotiate(server);
                        return Ok(Link { transport, decoder, heart_beat });
                    }
                    Ok(Decoded::Frame(frame)) if frame.command == Command::Error => {
                        let reason = frame.header("message").unwrap_or(frame.body.as_str());
                        return Err(ChatError::BrokerRejected(reason.to_owned()));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(room_id = self.chat_room_id, error = %err, "malformed frame during handshake");
                    }
                }
            }
        }
    }

    /// Subscribe, announce ENTER, then pump frames until closed or lost.
    async fn serve(&self, link: &mut Link, requests: &mut mpsc::UnboundedReceiver<Request>) -> Exit {
        let topic = self.broker.room_topic(self.chat_room_id);
        let subscribe = Frame::subscribe(&self.subscription_id, &topic);
        if let Err(err) = link.transport.send(encode_frame(&subscribe)).await {
            return Exit::Lost(err);
        }
        let enter = ChatMessage::enter(self.chat_room_id, self.session.user_id, &self.session.nickname);
        if let Err(err) = self.publish(link, &enter).await {
            return Exit::Lost(err);
        }

        let outgoing_ms = link.heart_beat.outgoing_ms;
        let incoming_ms = link.heart_beat.incoming_ms;
        let mut heartbeat = ticker(outgoing_ms);
        let mut watchdog = ticker(incoming_ms);
        let silence_limit = Duration::from_millis(incoming_ms).saturating_mul(HEARTBEAT_TOLERANCE);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                inbound = link.transport.recv() => match inbound {
                    Some(Ok(text)) => {
                        last_inbound = Instant::now();
                        self.handle_inbound(&mut link.decoder, &text);
                    }
                    Some(Err(err)) => return Exit::Lost(err),
                    None => return Exit::Lost(ChatError::Closed),
                },
                request = requests.recv() => match request {
                    Some(Request::Publish(message)) => {
                        if let Err(err) = self.publish(link, &message).await {
                            return Exit::Lost(err);
                        }
                    }
                    Some(Request::Close) | None => {
                        self.farewell(link).await;
                        return Exit::Closed;
                    }
                },
                _ = heartbeat.tick(), if outgoing_ms > 0 => {
                    if let Err(err) = link.transport.send(HEARTBEAT.to_owned()).await {
                        return Exit::Lost(err);
                    }
                }
                _ = watchdog.tick(), if incoming_ms > 0 => {
                    if last_inbound.elapsed() > silence_limit {
                        return Exit::Lost(ChatError::HeartbeatTimeout(incoming_ms));
                    }
                }
            }
        }
    }

    async fn publish(&self, link: &mut Link, message: &ChatMessage) -> Result<(), ChatError> {
        let body = message.to_json()?;
        let frame = Frame::send_json(&self.broker.app_destination, body);
        link.transport.send(encode_frame(&frame)).await
    }

    /// Best-effort LEAVE and DISCONNECT, then release the transport regardless.
    async fn farewell(&self, link: &mut Link) {
        let room_id = self.chat_room_id;
        let leave = ChatMessage::leave(room_id, self.session.user_id, &self.session.nickname);
        let goodbye = async {
            if let Err(err) = self.publish(link, &leave).await {
                tracing::warn!(room_id, error = %err, "LEAVE publish failed");
                return;
            }
            let disconnect = Frame::disconnect(&format!("disconnect-{room_id}"));
            if let Err(err) = link.transport.send(encode_frame(&disconnect)).await {
                tracing::debug!(room_id, error = %err, "DISCONNECT send failed");
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, goodbye).await.is_err() {
            tracing::warn!(room_id, "LEAVE publish timed out");
        }
        if tokio::time::timeout(CLOSE_GRACE, link.transport.close()).await.is_err() {
            tracing::debug!(room_id, "transport close timed out");
        }
    }

    fn handle_inbound(&self, decoder: &mut FrameDecoder, text: &str) {
        for item in decoder.push(text.as_bytes()) {
            match item {
                Ok(Decoded::HeartBeat) => {}
                Ok(Decoded::Frame(frame)) => self.handle_frame(frame),
                Err(err) => {
                    tracing::warn!(room_id = self.chat_room_id, error = %err, "dropping malformed frame");
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let room_id = self.chat_room_id;
        match frame.command {
            Command::Message => {
                if frame.header("subscription") != Some(self.subscription_id.as_str()) {
                    tracing::warn!(room_id, subscription = ?frame.header("subscription"), "dropping message for foreign subscription");
                    return;
                }
                let message = match decode_chat_message(&frame.body) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(room_id, error = %err, "dropping malformed chat message");
                        return;
                    }
                };
                if message.chat_room_id != room_id {
                    tracing::warn!(room_id, other_room = message.chat_room_id, "dropping message for another room");
                    return;
                }
                self.emit(ConnectionEvent::Message(message));
            }
            Command::Error => {
                let message = frame.header("message").unwrap_or_default().to_owned();
                tracing::warn!(room_id, message = %message, details = %frame.body, "broker reported error");
                self.emit(ConnectionEvent::BrokerError { message, details: frame.body });
            }
            Command::Receipt => {
                tracing::debug!(room_id, receipt = ?frame.header("receipt-id"), "receipt");
            }
            other => {
                tracing::debug!(room_id, command = other.as_str(), "ignoring unexpected frame");
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.emit(ConnectionEvent::State(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner may already be gone during teardown.
        let _ = self.events.send(event);
    }
}

/// Drain requests until the owner asks to close or drops the handle.
///
/// Publishes arriving while no session is live are discarded; the room
/// controller only publishes while connected, so these are races with a drop.
async fn wait_for_close(requests: &mut mpsc::UnboundedReceiver<Request>) {
    loop {
        match requests.recv().await {
            Some(Request::Publish(message)) => {
                tracing::warn!(room_id = message.chat_room_id, kind = ?message.kind, "discarding publish while disconnected");
            }
            Some(Request::Close) | None => return,
        }
    }
}

/// Interval whose first tick fires one period from now. A zero period yields
/// a placeholder that callers leave disabled.
fn ticker(period_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
