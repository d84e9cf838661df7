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

//! Session reconnection: disconnect detection, backoff, room recovery
//! and the offline send fallback.
//!
//! Verifies:
//! - The session detects a severed connection, backs off exponentially,
//!   reconnects, and rejoins its rooms so messaging resumes.
//! - Messages missed during the outage are replayed exactly once.
//! - Reconnect attempts stop after the configured maximum.
//! - Sends issued while offline either reach the fallback channel or
//!   fail loudly, and shutdown during reconnection is clean.
//!
//! ## Disconnect simulation
//!
//! Aborting the server task would not close already-accepted sockets
//! (they live on independently-spawned tasks). Instead a TCP proxy sits
//! between the client and the real server. Killing the proxy aborts all
//! tracked connection tasks, which drops both ends of every proxied TCP
//! stream and lets the client's WebSocket layer see the disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use huddle_client::config::ReconnectConfig;
use huddle_client::fallback::{FallbackError, NullFallback, SendFallback};
use huddle_client::session::{self, SessionCommand, SessionConfig, SessionEvent};
use huddle_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use huddle_proto::message::MessageRecord;
use huddle_proto::room::{RoomKind, RoomSummary};
use huddle_proto::user::{Role, UserProfile};
use huddle_server::auth::Authenticator;
use huddle_server::gateway::{ChatState, GatewaySettings, start_server_with_state};
use huddle_server::services::{
    InMemoryMessages, InMemoryRooms, InMemoryUsers, RoomRecord, Services, UserRecord,
};

const SUPPORT_ROOM: i64 = 1;

// =============================================================================
// TCP proxy helper
// =============================================================================

/// A TCP proxy that forwards traffic between a client-facing port and the
/// real server. Calling `kill()` aborts all tracked connection tasks,
/// which tears down both directions of every proxied TCP connection and
/// makes the client's WebSocket layer detect a disconnect.
struct TcpProxy {
    /// Address clients should connect to (127.0.0.1:<proxy_port>).
    pub client_addr: String,
    /// The acceptor task handle.
    accept_handle: tokio::task::JoinHandle<()>,
    /// All per-connection task handles. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Create a new TCP proxy from `proxy_port` to `backend_addr`.
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let bound_addr = listener.local_addr().unwrap();
        let client_addr = format!("127.0.0.1:{}", bound_addr.port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let (mut client_stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };

                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };

                    // Copy bidirectionally. When this task is aborted, both
                    // streams are dropped immediately, causing RST on both
                    // ends. We do NOT spawn sub-tasks so that abort propagates.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });

                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    /// Kill the proxy, severing all connections immediately.
    fn kill(self) {
        // Abort the accept loop so no new connections are accepted.
        self.accept_handle.abort();
        // Abort all per-connection tasks, which drops the TcpStreams and
        // causes immediate RST on both ends.
        let handles = self.conn_handles.lock();
        for h in handles.iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    // Brief pause to let the OS release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

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

/// Start a server on an OS-assigned port with alice (1) and bob (2)
/// sharing the support room. Returns the raw bound address.
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
    (addr.to_string(), authenticator)
}

/// Reconnect settings fast enough for tests.
fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        max_attempts,
        stability_threshold: Duration::from_secs(60),
        ping_interval: Duration::from_secs(30),
    }
}

fn session_config(url: &str, auth: &Authenticator, user_id: i64, max_attempts: u32) -> SessionConfig {
    let credential = auth
        .sign(UserId::new(user_id), Duration::from_secs(300))
        .expect("sign failed");
    SessionConfig {
        server_url: url.to_string(),
        credential,
        rooms: vec![RoomId::new(SUPPORT_ROOM)],
        reconnect: fast_reconnect(max_attempts),
    }
}

async fn connect(
    url: &str,
    auth: &Authenticator,
    user_id: i64,
) -> (mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionEvent>) {
    session::spawn_session(session_config(url, auth, user_id, 5), NullFallback)
        .await
        .expect("session failed to start")
}

/// Wait for a specific `SessionEvent` matching a predicate, with timeout.
///
/// Skips non-matching events. Panics on timeout or channel close.
async fn wait_for_event<F>(
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
    wait_for_event(rx, Duration::from_secs(15), "RoomJoined", |evt| {
        matches!(evt, SessionEvent::RoomJoined { .. })
    })
    .await
}

async fn wait_for_connected(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    wait_for_event(rx, Duration::from_secs(15), "Connected", |evt| {
        matches!(evt, SessionEvent::Connected { .. })
    })
    .await
}

async fn wait_for_disconnected(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    wait_for_event(rx, Duration::from_secs(10), "Disconnected", |evt| {
        matches!(evt, SessionEvent::Disconnected)
    })
    .await
}

async fn wait_for_reconnecting(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    wait_for_event(rx, Duration::from_secs(10), "Reconnecting", |evt| {
        matches!(evt, SessionEvent::Reconnecting { .. })
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

fn send(room: i64, content: &str) -> SessionCommand {
    SessionCommand::Send {
        room_id: RoomId::new(room),
        content: content.to_string(),
    }
}

/// Offline delivery double that records what was handed to it.
#[derive(Clone, Default)]
struct RecordingFallback {
    sent: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicI64>,
}

impl SendFallback for RecordingFallback {
    async fn create_message(
        &self,
        room_id: RoomId,
        sender: &UserProfile,
        content: &str,
    ) -> Result<MessageRecord, FallbackError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 10_000;
        self.sent.lock().push(content.to_string());
        Ok(MessageRecord {
            id: MessageId::new(id),
            room_id,
            sender_id: sender.id,
            content: content.to_string(),
            read: false,
            created_at: Timestamp::now(),
            sender: Some(sender.clone()),
        })
    }
}

// =============================================================================
// Test 1: Reconnect restores rooms and messaging
// =============================================================================

/// After the connection is severed (via proxy kill) and a new proxy is
/// established, the session reconnects on its own, rejoins its room, and
/// messaging resumes in both directions.
#[tokio::test]
async fn reconnect_restores_rooms_and_messaging() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    // Alice connects through the proxy, bob directly.
    let (alice_tx, mut alice_rx) = connect(&proxy_url, &auth, 1).await;
    wait_for_connected(&mut alice_rx).await;
    wait_for_joined(&mut alice_rx).await;

    let (bob_tx, mut bob_rx) = connect(&format!("ws://{server_addr}/ws"), &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;
    wait_for_event(&mut alice_rx, Duration::from_secs(10), "PeerJoined", |e| {
        matches!(e, SessionEvent::PeerJoined { .. })
    })
    .await;

    // Sever alice's path.
    proxy.kill();
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_disconnected(&mut alice_rx).await;

    let evt = wait_for_reconnecting(&mut alice_rx).await;
    let SessionEvent::Reconnecting { attempt, max_attempts } = evt else {
        unreachable!();
    };
    assert_eq!(attempt, 1, "first attempt should be 1");
    assert_eq!(max_attempts, 5);

    // Restore the path on the same port; the server never went away.
    let _proxy2 = TcpProxy::new(proxy_port, &server_addr).await;

    wait_for_connected(&mut alice_rx).await;
    wait_for_joined(&mut alice_rx).await;

    // Messaging works both ways after the recovery.
    bob_tx.send(send(SUPPORT_ROOM, "hello again")).await.unwrap();
    let evt = wait_for_event(&mut alice_rx, Duration::from_secs(15), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;
    let SessionEvent::MessageReceived { message, .. } = evt else {
        unreachable!();
    };
    assert_eq!(message.content, "hello again");

    alice_tx.send(send(SUPPORT_ROOM, "back online")).await.unwrap();
    let evt = wait_for_event(&mut bob_rx, Duration::from_secs(15), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;
    let SessionEvent::MessageReceived { message, .. } = evt else {
        unreachable!();
    };
    assert_eq!(message.content, "back online");
}

// =============================================================================
// Test 2: Missed messages replay exactly once
// =============================================================================

#[tokio::test]
async fn missed_messages_replay_after_reconnect() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let (_alice_tx, mut alice_rx) = connect(&proxy_url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;
    let (bob_tx, mut bob_rx) = connect(&format!("ws://{server_addr}/ws"), &auth, 2).await;
    wait_for_joined(&mut bob_rx).await;

    // A message alice does see: it sets her replay cursor.
    bob_tx.send(send(SUPPORT_ROOM, "before the drop")).await.unwrap();
    wait_for_event(&mut alice_rx, Duration::from_secs(15), "MessageReceived", |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    proxy.kill();
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_for_disconnected(&mut alice_rx).await;

    // Two messages land while alice is away.
    for text in ["while away 1", "while away 2"] {
        bob_tx.send(send(SUPPORT_ROOM, text)).await.unwrap();
        wait_for_event(&mut bob_rx, Duration::from_secs(15), "MessageAcked", |e| {
            matches!(e, SessionEvent::MessageAcked { .. })
        })
        .await;
    }

    let _proxy2 = TcpProxy::new(proxy_port, &server_addr).await;
    wait_for_connected(&mut alice_rx).await;

    // The resume carries exactly the gap.
    let evt = wait_for_event(&mut alice_rx, Duration::from_secs(15), "RoomRejoined", |e| {
        matches!(e, SessionEvent::RoomRejoined { .. })
    })
    .await;
    let SessionEvent::RoomRejoined { room_id, recovered, .. } = evt else {
        unreachable!();
    };
    assert_eq!(room_id, RoomId::new(SUPPORT_ROOM));
    assert_eq!(recovered, 2, "both missed messages must be recovered");

    let mut replayed = Vec::new();
    while replayed.len() < 2 {
        let evt = wait_for_event(&mut alice_rx, Duration::from_secs(15), "MessageReceived", |e| {
            matches!(e, SessionEvent::MessageReceived { .. })
        })
        .await;
        let SessionEvent::MessageReceived { message, .. } = evt else {
            unreachable!();
        };
        replayed.push(message.content);
    }
    assert_eq!(replayed, ["while away 1", "while away 2"]);

    // The pre-drop message was already seen and must not come back.
    assert_no_event(
        &mut alice_rx,
        Duration::from_millis(300),
        "replay of an already-seen message",
        |e| {
            matches!(
                e,
                SessionEvent::MessageReceived { message, .. } if message.content == "before the drop"
            )
        },
    )
    .await;
}

// =============================================================================
// Test 3: Exponential backoff timing and exhaustion
// =============================================================================

#[tokio::test]
async fn backoff_escalates_until_attempts_run_out() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    // Only three attempts so the test ends quickly.
    let (_alice_tx, mut alice_rx) =
        session::spawn_session(session_config(&proxy_url, &auth, 1, 3), NullFallback)
            .await
            .expect("session failed to start");
    wait_for_joined(&mut alice_rx).await;

    // Kill the proxy and never bring it back: every attempt must fail.
    proxy.kill();
    wait_for_disconnected(&mut alice_rx).await;

    // Collect all 3 Reconnecting events and measure the time between them.
    // With a 100ms initial delay the gaps should be ~200ms and ~400ms.
    let mut attempt_instants = Vec::new();
    for expected_attempt in 1..=3 {
        let evt = wait_for_event(
            &mut alice_rx,
            Duration::from_secs(10),
            &format!("Reconnecting attempt {expected_attempt}"),
            |evt| matches!(evt, SessionEvent::Reconnecting { .. }),
        )
        .await;
        attempt_instants.push(Instant::now());

        let SessionEvent::Reconnecting { attempt, max_attempts } = evt else {
            unreachable!();
        };
        assert_eq!(attempt, expected_attempt);
        assert_eq!(max_attempts, 3);
    }

    let gap_1_to_2 = attempt_instants[1] - attempt_instants[0];
    assert!(
        gap_1_to_2 >= Duration::from_millis(150),
        "gap between attempt 1 and 2 too short: {gap_1_to_2:?}"
    );
    let gap_2_to_3 = attempt_instants[2] - attempt_instants[1];
    assert!(
        gap_2_to_3 >= Duration::from_millis(300),
        "gap between attempt 2 and 3 too short: {gap_2_to_3:?}"
    );
    assert!(
        gap_2_to_3 > gap_1_to_2,
        "gap 2->3 ({gap_2_to_3:?}) should be larger than gap 1->2 ({gap_1_to_2:?})"
    );

    // Exhaustion is reported, then the event stream ends.
    wait_for_event(&mut alice_rx, Duration::from_secs(30), "ReconnectFailed", |e| {
        matches!(e, SessionEvent::ReconnectFailed)
    })
    .await;

    let mut closed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(2), alice_rx.recv()).await {
            Ok(None) => {
                closed = true;
                break;
            }
            Ok(Some(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "event channel should close after exhaustion");
}

// =============================================================================
// Test 4: Sends while offline fail loudly without a fallback
// =============================================================================

#[tokio::test]
async fn offline_send_without_fallback_fails_loudly() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let (alice_tx, mut alice_rx) = connect(&proxy_url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;

    proxy.kill();
    wait_for_disconnected(&mut alice_rx).await;

    alice_tx.send(send(SUPPORT_ROOM, "doomed")).await.unwrap();

    let evt = wait_for_event(&mut alice_rx, Duration::from_secs(10), "SendFailed", |e| {
        matches!(e, SessionEvent::SendFailed { .. })
    })
    .await;
    let SessionEvent::SendFailed { room_id, reason } = evt else {
        unreachable!();
    };
    assert_eq!(room_id, RoomId::new(SUPPORT_ROOM));
    assert!(!reason.is_empty());

    // The session still recovers once the path returns.
    let _proxy2 = TcpProxy::new(proxy_port, &server_addr).await;
    wait_for_connected(&mut alice_rx).await;
    wait_for_joined(&mut alice_rx).await;
}

// =============================================================================
// Test 5: Offline sends reach the fallback channel
// =============================================================================

#[tokio::test]
async fn offline_sends_reach_the_fallback_channel() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let fallback = RecordingFallback::default();
    let (alice_tx, mut alice_rx) =
        session::spawn_session(session_config(&proxy_url, &auth, 1, 5), fallback.clone())
            .await
            .expect("session failed to start");
    wait_for_joined(&mut alice_rx).await;

    proxy.kill();
    wait_for_disconnected(&mut alice_rx).await;

    alice_tx.send(send(SUPPORT_ROOM, "offline note")).await.unwrap();

    // Delivered through the side channel, surfaced as a normal ack.
    let evt = wait_for_event(&mut alice_rx, Duration::from_secs(10), "MessageAcked", |e| {
        matches!(e, SessionEvent::MessageAcked { .. })
    })
    .await;
    let SessionEvent::MessageAcked { message, .. } = evt else {
        unreachable!();
    };
    assert_eq!(message.content, "offline note");
    assert_eq!(message.sender_id, UserId::new(1));
    assert_eq!(fallback.sent.lock().as_slice(), ["offline note".to_string()]);

    // Live sends keep working after the path returns.
    let _proxy2 = TcpProxy::new(proxy_port, &server_addr).await;
    wait_for_connected(&mut alice_rx).await;
    wait_for_joined(&mut alice_rx).await;

    alice_tx.send(send(SUPPORT_ROOM, "live again")).await.unwrap();
    wait_for_event(&mut alice_rx, Duration::from_secs(15), "MessageAcked", |e| {
        matches!(e, SessionEvent::MessageAcked { .. })
    })
    .await;
}

// =============================================================================
// Test 6: Graceful shutdown during reconnect
// =============================================================================

#[tokio::test]
async fn shutdown_during_reconnect_closes_cleanly() {
    let (server_addr, auth) = start_server().await;

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &server_addr).await;
    let proxy_url = format!("ws://{}/ws", proxy.client_addr);

    let (alice_tx, mut alice_rx) = connect(&proxy_url, &auth, 1).await;
    wait_for_joined(&mut alice_rx).await;

    // Kill the proxy and leave it dead so attempts keep failing.
    proxy.kill();
    wait_for_disconnected(&mut alice_rx).await;
    wait_for_reconnecting(&mut alice_rx).await;

    alice_tx.send(SessionCommand::Shutdown).await.unwrap();

    // The channel closes cleanly (no panic, recv returns None eventually).
    let mut closed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(2), alice_rx.recv()).await {
            Ok(None) => {
                closed = true;
                break;
            }
            Ok(Some(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "event channel should close after shutdown");
}
