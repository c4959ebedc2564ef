//! In-memory broker, history source and message builders shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frames::chat::{ChatHistory, ChatMessage, MessageType, decode_chat_message};
use frames::{Command, Decoded, Frame, FrameDecoder, encode_frame};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::ChatError;
use crate::net::api::HistorySource;
use crate::net::transport::{Connector, Transport};
use crate::session::Session;

const FRAME_WAIT: Duration = Duration::from_secs(2);
const ACCEPT_WAIT: Duration = Duration::from_secs(600);

// =============================================================================
// MESSAGES
// =============================================================================

#[must_use]
pub fn session(user_id: i64, nickname: &str) -> Session {
    Session::new(user_id, nickname, Some("test-token".to_owned()))
}

/// Confirmed TALK as the server would broadcast it.
#[must_use]
pub fn confirmed_talk(room: i64, id: i64, sender: i64, nickname: &str, text: &str) -> ChatMessage {
    let mut message = ChatMessage::talk(room, sender, nickname, text, "2024-05-01T10:20:30".to_owned());
    message.chat_message_id = Some(id);
    message
}

/// Confirmed presence event as the server would broadcast it.
#[must_use]
pub fn confirmed_presence(kind: MessageType, room: i64, id: i64, sender: i64, nickname: &str) -> ChatMessage {
    let mut message = match kind {
        MessageType::Leave => ChatMessage::leave(room, sender, nickname),
        _ => ChatMessage::enter(room, sender, nickname),
    };
    message.chat_message_id = Some(id);
    message.sent_at = Some("2024-05-01T10:20:30".to_owned());
    message
}

// =============================================================================
// MEMORY BROKER
// =============================================================================

/// Connector whose transports terminate in [`BrokerPeer`]s handed to the test.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<BrokerPeer>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

/// Test side of a [`MemoryConnector`]: yields one peer per successful connect.
pub struct MemoryBroker {
    peers: mpsc::UnboundedReceiver<BrokerPeer>,
}

#[must_use]
pub fn memory_broker() -> (Arc<MemoryConnector>, MemoryBroker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector { peers: tx, failures: AtomicU32::new(0), attempts: AtomicU32::new(0) };
    (Arc::new(connector), MemoryBroker { peers: rx })
}

impl MemoryConnector {
    /// Make the next `count` connects fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total connect calls, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::Closed);
        }

        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let peer = BrokerPeer {
            url: url.to_owned(),
            inbound: from_client,
            outbound: Some(to_client),
            closed: closed.clone(),
            decoder: FrameDecoder::default(),
            queue: VecDeque::new(),
        };
        self.peers.send(peer).map_err(|_| ChatError::Closed)?;
        Ok(Box::new(MemoryTransport { outbound: to_broker, inbound: from_broker, closed }))
    }
}

struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), ChatError> {
        self.outbound.send(text).map_err(|_| ChatError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, ChatError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
    }
}

impl MemoryBroker {
    /// Wait for the client's next successful connect.
    pub async fn accept(&mut self) -> BrokerPeer {
        timeout(ACCEPT_WAIT, self.peers.recv())
            .await
            .expect("client should connect")
            .expect("connector dropped")
    }

    /// A peer if the client has connected since the last call.
    pub fn try_accept(&mut self) -> Option<BrokerPeer> {
        self.peers.try_recv().ok()
    }
}

/// Broker end of one in-memory transport.
pub struct BrokerPeer {
    pub url: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
    decoder: FrameDecoder,
    queue: VecDeque<Decoded>,
}

/// What the client did right after the handshake.
pub struct Joined {
    pub subscription: String,
    pub destination: String,
    pub enter: ChatMessage,
}

impl BrokerPeer {
    /// Next decoded item from the client, heart-beats included.
    pub async fn next_item(&mut self) -> Decoded {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return item;
            }
            let text = timeout(FRAME_WAIT, self.inbound.recv())
                .await
                .expect("client frame timed out")
                .expect("client transport dropped");
            for item in self.decoder.push(text.as_bytes()) {
                self.queue.push_back(item.expect("client sent a malformed frame"));
            }
        }
    }

    /// Next frame from the client, skipping heart-beats.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let Decoded::Frame(frame) = self.next_item().await {
                return frame;
            }
        }
    }

    pub async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame: {frame:?}");
        frame
    }

    /// Next published chat message.
    pub async fn next_published(&mut self) -> ChatMessage {
        let frame = self.expect(Command::Send).await;
        decode_chat_message(&frame.body).expect("client published invalid chat message")
    }

    /// Answer CONNECT with CONNECTED advertising `heart_beat`.
    pub async fn handshake(&mut self, heart_beat: &str) -> Frame {
        let connect = self.expect(Command::Connect).await;
        self.send(&Frame::new(Command::Connected).with_header("version", "1.2").with_header("heart-beat", heart_beat));
        connect
    }

    /// Handshake without heart-beats, then collect SUBSCRIBE and ENTER.
    pub async fn join(&mut self) -> Joined {
        self.handshake("0,0").await;
        let subscribe = self.expect(Command::Subscribe).await;
        let enter = self.next_published().await;
        Joined {
            subscription: subscribe.header("id").unwrap_or_default().to_owned(),
            destination: subscribe.header("destination").unwrap_or_default().to_owned(),
            enter,
        }
    }

    pub fn send(&self, frame: &Frame) {
        self.send_raw(&encode_frame(frame));
    }

    pub fn send_raw(&self, text: &str) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(text.to_owned());
        }
    }

    /// Broadcast `message` on `subscription` as a MESSAGE frame.
    pub fn deliver(&self, subscription: &str, message: &ChatMessage) {
        let body = message.to_json().expect("message serializes");
        self.send(
            &Frame::new(Command::Message)
                .with_header("destination", format!("/topic/chat/room/{}", message.chat_room_id))
                .with_header("subscription", subscription)
                .with_header("message-id", format!("m-{}", message.chat_message_id.unwrap_or_default()))
                .with_body(body),
        );
    }

    /// Stop sending to the client; its next receive sees end of stream.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }

    /// Stop reading from the client; its next send fails.
    pub fn stop_reading(&mut self) {
        self.inbound.close();
        while self.inbound.try_recv().is_ok() {}
    }

    /// Whether the client has released its transport.
    #[must_use]
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Everything the client has sent that is ready right now, decoded.
    pub fn drain(&mut self) -> Vec<Decoded> {
        while let Ok(text) = self.inbound.try_recv() {
            for item in self.decoder.push(text.as_bytes()) {
                self.queue.push_back(item.expect("client sent a malformed frame"));
            }
        }
        self.queue.drain(..).collect()
    }
}

// =============================================================================
// HISTORY
// =============================================================================

/// Canned history keyed by product id; unknown products answer 404.
#[derive(Default)]
pub struct MockHistory {
    rooms: HashMap<i64, ChatHistory>,
    calls: Mutex<Vec<i64>>,
}

impl MockHistory {
    #[must_use]
    pub fn with_room(mut self, product_id: i64, history: ChatHistory) -> Self {
        self.rooms.insert(product_id, history);
        self
    }

    /// Product ids requested so far.
    #[must_use]
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().expect("mock mutex should lock").clone()
    }
}

#[async_trait::async_trait]
impl HistorySource for MockHistory {
    async fn load_history(&self, product_id: i64, session: &Session) -> Result<ChatHistory, ChatError> {
        self.calls.lock().expect("mock mutex should lock").push(product_id);
        if session.token().is_none() {
            return Err(ChatError::LoginRequired);
        }
        self.rooms.get(&product_id).cloned().ok_or_else(|| ChatError::HttpStatus {
            endpoint: format!("/api/chat/history/{product_id}"),
            status: 404,
        })
    }
}
