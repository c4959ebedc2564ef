use super::*;
use crate::config::{DEFAULT_BROKER_URL, ReconnectPolicy};
use crate::test_helpers::{confirmed_talk, memory_broker, session};
use frames::chat::MessageType;
use tokio::time::timeout;

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        heart_beat: HeartBeat::new(0, 0),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: Some(3),
        },
        ..BrokerConfig::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("connection event timed out")
        .expect("event channel closed")
}

async fn wait_for_state(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, target: ConnectionState) {
    loop {
        if next_event(events).await == ConnectionEvent::State(target) {
            return;
        }
    }
}

fn states(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::State(state) = event {
            seen.push(state);
        }
    }
    seen
}

#[tokio::test]
async fn connects_subscribes_then_announces_enter() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));

    let mut peer = broker.accept().await;
    assert_eq!(peer.url, DEFAULT_BROKER_URL);

    let connect = peer.handshake("0,0").await;
    assert_eq!(connect.header("host"), Some("localhost:8080"));
    assert_eq!(connect.header("accept-version"), Some("1.2,1.1,1.0"));
    assert_eq!(connect.header("heart-beat"), Some("0,0"));
    assert_eq!(connect.header("Authorization"), Some("Bearer test-token"));

    let subscribe = peer.expect(Command::Subscribe).await;
    assert_eq!(subscribe.header("destination"), Some("/topic/chat/room/7"));

    let enter = peer.expect(Command::Send).await;
    assert_eq!(enter.header("destination"), Some("/app/chat/message"));
    let enter = decode_chat_message(&enter.body).unwrap();
    assert_eq!(enter.kind, MessageType::Enter);
    assert_eq!(enter.chat_room_id, 7);
    assert_eq!(enter.sender_id, 3);
    assert_eq!(enter.sender_nickname, "buyer");
    assert!(enter.chat_message_id.is_none());

    assert_eq!(next_event(&mut events).await, ConnectionEvent::State(ConnectionState::Connecting));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::State(ConnectionState::Connected));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.chat_room_id(), 7);

    manager.close().await;
}

#[tokio::test]
async fn forwards_room_messages_and_drops_everything_else() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    let joined = peer.join().await;
    assert_eq!(joined.destination, "/topic/chat/room/7");
    wait_for_state(&mut events, ConnectionState::Connected).await;

    peer.deliver("some-other-subscription", &confirmed_talk(7, 1, 4, "seller", "wrong subscription"));
    peer.deliver(&joined.subscription, &confirmed_talk(8, 2, 4, "seller", "wrong room"));
    peer.send(
        &Frame::new(Command::Message)
            .with_header("subscription", &joined.subscription)
            .with_body("{not json"),
    );
    peer.send(
        &Frame::new(Command::Message)
            .with_header("subscription", &joined.subscription)
            .with_body(r#"{"type":"SHOUT","chatRoomId":7,"senderId":4,"message":"hi"}"#),
    );
    peer.send(
        &Frame::new(Command::Message)
            .with_header("subscription", &joined.subscription)
            .with_body(r#"{"type":"TALK","chatRoomId":7,"senderId":4,"message":"   ","chatMessageId":9}"#),
    );
    peer.send_raw("GARBAGE\n\n\0");

    let expected = confirmed_talk(7, 3, 4, "seller", "is this still available?");
    peer.deliver(&joined.subscription, &expected);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Message(expected));
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.close().await;
}

#[tokio::test]
async fn bogus_content_length_does_not_stall_the_room() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    let joined = peer.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    peer.send_raw("MESSAGE\ncontent-length:18446744073709551615\n\nx\0");
    peer.send_raw("MESSAGE\ncontent-length:1000000\n\nshort\0");
    peer.send_raw("\n");

    let expected = confirmed_talk(7, 3, 4, "seller", "still here");
    peer.deliver(&joined.subscription, &expected);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Message(expected));
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.close().await;
}

#[tokio::test]
async fn broker_error_frame_is_reported_and_session_survives() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    let joined = peer.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    peer.send(
        &Frame::new(Command::Error)
            .with_header("message", "destination not allowed")
            .with_body("no route"),
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::BrokerError { message: "destination not allowed".to_owned(), details: "no route".to_owned() }
    );

    let after = confirmed_talk(7, 5, 4, "seller", "still here");
    peer.deliver(&joined.subscription, &after);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Message(after));
    manager.close().await;
}

#[tokio::test]
async fn publish_is_refused_before_handshake_completes() {
    let (connector, mut broker) = memory_broker();
    let (manager, _events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let _peer = broker.accept().await;

    let err = manager.publish(ChatMessage::talk(7, 3, "buyer", "hello", "now".to_owned())).unwrap_err();
    assert!(matches!(err, ChatError::NotConnected(state) if !state.is_connected()));
    manager.close().await;
}

#[tokio::test]
async fn publish_while_connected_sends_json_to_app_destination() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    peer.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    let talk = ChatMessage::talk(7, 3, "buyer", "hello", "2024-05-01T10:20:30Z".to_owned());
    manager.publish(talk.clone()).unwrap();

    let frame = peer.expect(Command::Send).await;
    assert_eq!(frame.header("destination"), Some("/app/chat/message"));
    assert_eq!(frame.header("content-type"), Some("application/json"));
    assert_eq!(decode_chat_message(&frame.body).unwrap(), talk);
    manager.close().await;
}

#[tokio::test]
async fn close_sends_leave_then_disconnect_and_releases_transport() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    peer.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    manager.close().await;

    let frames: Vec<Frame> = peer
        .drain()
        .into_iter()
        .filter_map(|item| match item {
            Decoded::Frame(frame) => Some(frame),
            Decoded::HeartBeat => None,
        })
        .collect();
    assert_eq!(frames.len(), 2, "expected LEAVE then DISCONNECT, got {frames:?}");
    assert_eq!(frames[0].command, Command::Send);
    let leave = decode_chat_message(&frames[0].body).unwrap();
    assert_eq!(leave.kind, MessageType::Leave);
    assert_eq!(leave.sender_id, 3);
    assert_eq!(frames[1].command, Command::Disconnect);

    assert!(peer.client_closed());
    assert_eq!(states(&mut events).last(), Some(&ConnectionState::Closed));
}

#[tokio::test]
async fn close_completes_even_when_leave_cannot_be_sent() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut peer = broker.accept().await;
    peer.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
    let state = manager.watch_state();

    peer.stop_reading();
    manager.close().await;

    assert!(peer.client_closed());
    assert_eq!(*state.borrow(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn reconnects_with_backoff_after_transport_loss() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut first = broker.accept().await;
    first.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    first.hang_up();
    wait_for_state(&mut events, ConnectionState::Reconnecting { attempt: 1 }).await;
    let lost_at = Instant::now();

    let mut second = broker.accept().await;
    assert!(lost_at.elapsed() >= Duration::from_millis(100));
    assert!(first.client_closed());

    let rejoined = second.join().await;
    assert_eq!(rejoined.enter.kind, MessageType::Enter);
    wait_for_state(&mut events, ConnectionState::Connected).await;
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn handshake_rejection_is_retried() {
    let (connector, mut broker) = memory_broker();
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));

    let mut first = broker.accept().await;
    first.expect(Command::Connect).await;
    first.send(&Frame::new(Command::Error).with_header("message", "bad credentials"));
    wait_for_state(&mut events, ConnectionState::Reconnecting { attempt: 1 }).await;

    let mut second = broker.accept().await;
    second.join().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let (connector, mut broker) = memory_broker();
    connector.fail_next(100);
    let (manager, mut events) = ConnectionManager::open(connector.clone(), broker_config(), 7, session(3, "buyer"));

    wait_for_state(&mut events, ConnectionState::Failed).await;
    assert_eq!(connector.attempts(), 4);
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert!(broker.try_accept().is_none());

    manager.close().await;
    assert_eq!(states(&mut events), vec![ConnectionState::Closed]);
}

#[tokio::test(start_paused = true)]
async fn backoff_schedule_is_reported_per_attempt() {
    let (connector, _broker) = memory_broker();
    connector.fail_next(100);
    let (manager, mut events) = ConnectionManager::open(connector, broker_config(), 7, session(3, "buyer"));
    let mut seen = Vec::new();
    loop {
        let ConnectionEvent::State(state) = next_event(&mut events).await else { continue };
        seen.push(state);
        if state == ConnectionState::Failed {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting { attempt: 1 },
            ConnectionState::Reconnecting { attempt: 2 },
            ConnectionState::Reconnecting { attempt: 3 },
            ConnectionState::Failed,
        ]
    );
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_while_backing_off_ends_closed() {
    let (connector, _broker) = memory_broker();
    connector.fail_next(100);
    let (manager, mut events) = ConnectionManager::open(connector.clone(), broker_config(), 7, session(3, "buyer"));
    wait_for_state(&mut events, ConnectionState::Reconnecting { attempt: 1 }).await;

    manager.close().await;
    assert_eq!(states(&mut events).last(), Some(&ConnectionState::Closed));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_broker_is_treated_as_lost() {
    let (connector, mut broker) = memory_broker();
    let config = BrokerConfig { heart_beat: HeartBeat::new(0, 1000), ..broker_config() };
    let (manager, mut events) = ConnectionManager::open(connector, config, 7, session(3, "buyer"));

    let mut peer = broker.accept().await;
    peer.handshake("1000,0").await;
    peer.expect(Command::Subscribe).await;
    peer.next_published().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    wait_for_state(&mut events, ConnectionState::Reconnecting { attempt: 1 }).await;
    assert!(peer.client_closed());
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeats_are_sent_at_negotiated_interval() {
    let (connector, mut broker) = memory_broker();
    let config = BrokerConfig { heart_beat: HeartBeat::new(1000, 0), ..broker_config() };
    let (manager, mut events) = ConnectionManager::open(connector, config, 7, session(3, "buyer"));

    let mut peer = broker.accept().await;
    peer.handshake("0,1000").await;
    peer.expect(Command::Subscribe).await;
    peer.next_published().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let beats = peer.drain().into_iter().filter(|item| *item == Decoded::HeartBeat).count();
    assert!(beats >= 3, "expected at least 3 heart-beats, got {beats}");
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager.close().await;
}

#[test]
fn state_display_is_human_readable() {
    assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    assert_eq!(ConnectionState::Reconnecting { attempt: 2 }.to_string(), "reconnecting (attempt 2)");
    assert!(ConnectionState::Failed.is_terminal());
    assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_terminal());
}
