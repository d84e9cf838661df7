// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Read receipts: marking, fan-out and the persisted read flags.
//!
//! Verifies:
//! - Marking a room read notifies the other participants and is not
//!   echoed to the reader.
//! - The read flag lands in message history: a later replay shows peer
//!   messages as read while the reader's own messages stay untouched.
//! - Marking an empty room read is harmless and still fans out.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use huddle_client::config::ReconnectConfig;
use huddle_client::fallback::NullFallback;
use huddle_client::session::{self, SessionCommand, SessionConfig, SessionEvent};
use huddle_proto::codec;
use huddle_proto::event::{ClientEvent, ResumeRoom, ServerEvent};
use huddle_proto::ids::{RoomId, UserId};
use huddle_proto::message::MessageRecord;
use huddle_proto::room::{RoomKind, RoomSummary};
use huddle_proto::user::{Role, UserProfile};
use huddle_server::auth::Authenticator;
use huddle_server::gateway::{ChatState, GatewaySettings, start_server_with_state};
use huddle_server::services::{
    InMemoryMessages, InMemoryRooms, InMemoryUsers, RoomRecord, Services, UserRecord,
};

const SUPPORT_ROOM: i64 = 1;

type RawWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn user(id: i64, name: &str, role: Role) -> UserRecord {
    UserRecord {
        profile: UserProfile {
            id: UserId::new(id),
            name: name.to_string(),
            avatar: None,
            role,
        },
        active: true,
    }
}

/// Start a server with alice (1) and bob (2) sharing the support room.
async fn start_server() -> (String, Authenticator) {
    let authenticator = Authenticator::new("integration-secret");
    let services = Services {
        rooms: InMemoryRooms::with_rooms([RoomRecord {
            summary: RoomSummary {
                id: RoomId::new(SUPPORT_ROOM),
                name: "Support".to_string(),
                kind: RoomKind::Group,
                active: true,
            },
            participant_ids: vec![UserId::new(1), UserId::new(2)],
            last_message_at: None,
        }]),
        store: InMemoryMessages::new(),
        users: InMemoryUsers::with_users([
            user(1, "alice", Role::Member),
            user(2, "bob", Role::Support),
        ]),
    };
    let state = Arc::new(ChatState::with_settings(
        authenticator.clone(),
        services,
        GatewaySettings::default(),
    ));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("server failed to start");
    (format!("ws://{addr}/ws"), authenticator)
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        max_attempts: 5,
        stability_threshold: Duration::from_secs(30),
        ping_interval: Duration::from_secs(30),
    }
}

async fn connect(
    url: &str,
    auth: &Authenticator,
    user_id: i64,
) -> (mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionEvent>) {
    let credential = auth
        .sign(UserId::new(user_id), Duration::from_secs(300))
        .expect("sign failed");
    let config = SessionConfig {
        server_url: url.to_string(),
        credential,
        rooms: vec![RoomId::new(SUPPORT_ROOM)],
        reconnect: fast_reconnect(),
    };
    session::spawn_session(config, NullFallback)
        .await
        .expect("session failed to start")
}

/// Wait for a specific `SessionEvent` matching a predicate, with timeout.
async fn wait_for<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

async fn wait_for_joined(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    wait_for(rx, Duration::from_secs(10), "RoomJoined", |evt| {
        matches!(evt, SessionEvent::RoomJoined { .. })
    })
    .await
}

/// Assert that no event matching `pred` arrives within `window`.
async fn assert_no_event<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    window: Duration,
    description: &str,
    pred: F,
) where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => panic!("unexpected {description}: {evt:?}"),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
}

/// Open a raw socket and authenticate with a first frame.
async fn raw_authenticated(url: &str, auth: &Authenticator, user_id: i64) -> RawWs {
    let credential = auth
        .sign(UserId::new(user_id), Duration::from_secs(300))
        .expect("sign failed");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("connect failed");
    let frame =
        codec::encode(&ClientEvent::Authenticate { credential }).expect("encode failed");
    ws.send(Message::Text(frame.into())).await.expect("send failed");
    let first = wait_for_frame(&mut ws, "Connected", |e| {
        matches!(e, ServerEvent::Connected { .. })
    })
    .await;
    let ServerEvent::Connected { .. } = first else {
        unreachable!();
    };
    ws
}

/// Wait for a server frame matching a predicate on a raw socket.
async fn wait_for_frame<F>(ws: &mut RawWs, description: &str, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let event: ServerEvent =
                    codec::decode(text.as_str()).expect("undecodable server frame");
                if pred(&event) {
                    return event;
                }
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("connection ended while waiting for {description}: {other:?}"),
        }
    }
}

/// Replay the full room history through a fresh resume and return it.
async fn replay_history(url: &str, auth: &Authenticator, user_id: i64) -> Vec<MessageRecord> {
    let mut ws = raw_authenticated(url, auth, user_id).await;
    let frame = codec::encode(&ClientEvent::Resume {
        rooms: vec![ResumeRoom {
            room_id: RoomId::new(SUPPORT_ROOM),
            last_seen_ms: Some(0),
        }],
    })
    .expect("encode failed");
    ws.send(Message::Text(frame.into())).await.expect("send failed");

    let resumed = wait_for_frame(&mut ws, "RoomResumed", |e| {
        matches!(e, ServerEvent::RoomResumed { .. })
    })
    .await;
    let ServerEvent::RoomResumed { missed, .. } = resumed else {
        unreachable!();
    };
    missed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn marking_read_notifies_other_participants() {
    let (url, auth) = start_server().await;

    let (alice_tx, mut alice_rx) = connect(&url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;
    let (bob_tx, mut bob_rx) = connect(&url, &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;

    alice_tx
        .send(SessionCommand::Send {
            room_id: RoomId::new(SUPPORT_ROOM),
            content: "any update?".to_string(),
        })
        .await
        .unwrap();
    wait_for(&mut bob_rx, Duration::from_secs(10), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    bob_tx
        .send(SessionCommand::MarkRead {
            room_id: RoomId::new(SUPPORT_ROOM),
        })
        .await
        .unwrap();

    let receipt = wait_for(&mut alice_rx, Duration::from_secs(10), "MessagesRead", |e| {
        matches!(e, SessionEvent::MessagesRead { .. })
    })
    .await;
    assert_eq!(
        receipt,
        SessionEvent::MessagesRead {
            room_id: RoomId::new(SUPPORT_ROOM),
            user_id: UserId::new(2),
        }
    );

    // The reader gets no echo of its own receipt.
    assert_no_event(
        &mut bob_rx,
        Duration::from_millis(300),
        "receipt echo to the reader",
        |e| matches!(e, SessionEvent::MessagesRead { .. }),
    )
    .await;
}

#[tokio::test]
async fn read_flags_persist_into_history() {
    let (url, auth) = start_server().await;

    let (alice_tx, mut alice_rx) = connect(&url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;
    let (bob_tx, mut bob_rx) = connect(&url, &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;

    alice_tx
        .send(SessionCommand::Send {
            room_id: RoomId::new(SUPPORT_ROOM),
            content: "please confirm".to_string(),
        })
        .await
        .unwrap();
    wait_for(&mut bob_rx, Duration::from_secs(10), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    bob_tx
        .send(SessionCommand::MarkRead {
            room_id: RoomId::new(SUPPORT_ROOM),
        })
        .await
        .unwrap();
    wait_for(&mut alice_rx, Duration::from_secs(10), "MessagesRead", |e| {
        matches!(e, SessionEvent::MessagesRead { .. })
    })
    .await;

    let history = replay_history(&url, &auth, 2).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender_id, UserId::new(1));
    assert!(history[0].read, "bob's receipt must stick to alice's message");
}

#[tokio::test]
async fn readers_do_not_mark_their_own_messages() {
    let (url, auth) = start_server().await;

    let (alice_tx, mut alice_rx) = connect(&url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;
    let (bob_tx, mut bob_rx) = connect(&url, &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;

    alice_tx
        .send(SessionCommand::Send {
            room_id: RoomId::new(SUPPORT_ROOM),
            content: "mine".to_string(),
        })
        .await
        .unwrap();
    bob_tx
        .send(SessionCommand::Send {
            room_id: RoomId::new(SUPPORT_ROOM),
            content: "yours".to_string(),
        })
        .await
        .unwrap();
    wait_for(&mut alice_rx, Duration::from_secs(10), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    // Alice reads the room: only bob's message may flip to read.
    alice_tx
        .send(SessionCommand::MarkRead {
            room_id: RoomId::new(SUPPORT_ROOM),
        })
        .await
        .unwrap();
    wait_for(&mut bob_rx, Duration::from_secs(10), "MessagesRead", |e| {
        matches!(e, SessionEvent::MessagesRead { .. })
    })
    .await;

    let history = replay_history(&url, &auth, 1).await;
    assert_eq!(history.len(), 2);
    for record in &history {
        if record.sender_id == UserId::new(2) {
            assert!(record.read, "peer message should be read: {record:?}");
        } else {
            assert!(!record.read, "own message must stay unread: {record:?}");
        }
    }
}

#[tokio::test]
async fn marking_an_empty_room_read_is_harmless() {
    let (url, auth) = start_server().await;

    let (_alice_tx, mut alice_rx) = connect(&url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;
    let (bob_tx, mut bob_rx) = connect(&url, &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;

    bob_tx
        .send(SessionCommand::MarkRead {
            room_id: RoomId::new(SUPPORT_ROOM),
        })
        .await
        .unwrap();

    // The receipt still fans out, and nothing errors on the reader side.
    wait_for(&mut alice_rx, Duration::from_secs(10), "MessagesRead", |e| {
        matches!(e, SessionEvent::MessagesRead { .. })
    })
    .await;
    assert_no_event(
        &mut bob_rx,
        Duration::from_millis(300),
        "error after an empty mark-read",
        |e| matches!(e, SessionEvent::ServerError { .. }),
    )
    .await;
}
