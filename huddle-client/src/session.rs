//! Session manager: owns the WebSocket connection to a huddle server.
//!
//! [`spawn_session`] connects, authenticates, and hands back a pair of
//! channels: the caller issues [`SessionCommand`]s and drains
//! [`SessionEvent`]s. A background task owns the connection and the
//! [`ClientState`], reconnects with capped doubling backoff when the
//! link drops, and replays room membership once it is back. Messages
//! composed while disconnected go through the configured
//! [`SendFallback`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use huddle_proto::codec::{self, CodecError};
use huddle_proto::event::{ClientEvent, ErrorCode, ServerEvent};
use huddle_proto::ids::{RoomId, UserId};
use huddle_proto::message::MessageRecord;
use huddle_proto::room::{LeaveReason, RoomSummary};
use huddle_proto::user::UserProfile;

use crate::config::ReconnectConfig;
use crate::fallback::{FallbackError, SendFallback};
use crate::state::ClientState;

/// Type alias for the write half of the WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of the WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for establishing the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the server's answer to the presented credential.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the command and event channels.
const CHANNEL_CAPACITY: usize = 256;

/// Connection settings for one chat session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the chat server (e.g. `ws://127.0.0.1:4010/ws`).
    pub server_url: String,
    /// Signed credential presented during the handshake.
    pub credential: String,
    /// Rooms to join as soon as the session is up.
    pub rooms: Vec<RoomId>,
    /// Reconnection tuning.
    pub reconnect: ReconnectConfig,
}

/// Instructions from the caller to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Join a room now and again after every reconnect.
    Join {
        /// Target room.
        room_id: RoomId,
    },
    /// Leave a room and stop rejoining it.
    Leave {
        /// Target room.
        room_id: RoomId,
    },
    /// Send a chat message to a room.
    Send {
        /// Target room.
        room_id: RoomId,
        /// Raw message text, validated server-side.
        content: String,
    },
    /// Report the local user's typing state in a room.
    Typing {
        /// Target room.
        room_id: RoomId,
        /// `true` while composing.
        is_typing: bool,
    },
    /// Mark other participants' messages in a room as read.
    MarkRead {
        /// Target room.
        room_id: RoomId,
    },
    /// Close the connection and end the session.
    Shutdown,
}

/// Notifications from the session task to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection is up and authenticated. Emitted once per
    /// connection, including after reconnects.
    Connected {
        /// Identity the server confirmed.
        user: UserProfile,
    },
    /// The connection dropped; reconnection attempts follow.
    Disconnected,
    /// A reconnect attempt is about to start.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Configured attempt ceiling.
        max_attempts: u32,
    },
    /// Every reconnect attempt failed. The session is over.
    ReconnectFailed,
    /// The server ordered this session to disconnect. No reconnection.
    Evicted {
        /// Server-supplied reason.
        reason: String,
    },
    /// A room join was confirmed.
    RoomJoined {
        /// Room metadata.
        room: RoomSummary,
        /// Durable participants of the room.
        participants: Vec<UserProfile>,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// A room was re-entered after a reconnect.
    RoomRejoined {
        /// Room that was rejoined.
        room_id: RoomId,
        /// How many missed messages were recovered.
        recovered: usize,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// A room was left.
    RoomLeft {
        /// Room that was left.
        room_id: RoomId,
    },
    /// Another participant's message arrived.
    MessageReceived {
        /// Room the message belongs to.
        room_id: RoomId,
        /// The persisted message.
        message: MessageRecord,
    },
    /// One of our own messages was persisted.
    MessageAcked {
        /// Room the message was sent to.
        room_id: RoomId,
        /// The message as persisted, attributed to the local user.
        message: MessageRecord,
    },
    /// One of our own messages could not be delivered.
    SendFailed {
        /// Room the message was meant for.
        room_id: RoomId,
        /// Why delivery failed.
        reason: String,
    },
    /// A participant became present in a room.
    PeerJoined {
        /// Room in question.
        room_id: RoomId,
        /// Identity of the participant.
        user: UserProfile,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// A participant dropped out of a room's presence.
    PeerLeft {
        /// Room in question.
        room_id: RoomId,
        /// Participant who left.
        user_id: UserId,
        /// Why presence ended.
        reason: LeaveReason,
    },
    /// A participant started or stopped typing.
    PeerTyping {
        /// Room in question.
        room_id: RoomId,
        /// Participant whose typing state changed.
        user_id: UserId,
        /// Current typing state.
        is_typing: bool,
    },
    /// A participant marked the room's messages as read.
    MessagesRead {
        /// Room in question.
        room_id: RoomId,
        /// Participant who read the messages.
        user_id: UserId,
    },
    /// The server reported a failed operation.
    ServerError {
        /// Stable machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

/// Errors that can prevent a session from starting.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server URL could not be parsed.
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The WebSocket connection failed.
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connecting or authenticating took too long.
    #[error("timed out waiting for the server")]
    Timeout,

    /// The server rejected the presented credential.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The server closed the connection during the handshake.
    #[error("connection closed during handshake")]
    HandshakeClosed,

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Deterministic doubling backoff, capped at `max_delay`.
///
/// `attempt` is 1-based: attempt 1 waits `initial_delay`, attempt 2
/// twice that, and so on.
#[must_use]
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(31);
    config
        .initial_delay
        .saturating_mul(2u32.saturating_pow(doublings))
        .min(config.max_delay)
}

/// Connect to a chat server and start the session task.
///
/// Returns the command sender and event receiver once the first
/// connection is authenticated. Dropping the command sender (or sending
/// [`SessionCommand::Shutdown`]) ends the session; the event channel
/// closes when the session is over.
///
/// # Errors
///
/// Returns [`SessionError`] if the URL is invalid, the server is
/// unreachable, or the credential is rejected.
pub async fn spawn_session<F>(
    config: SessionConfig,
    fallback: F,
) -> Result<(mpsc::Sender<SessionCommand>, mpsc::Receiver<SessionEvent>), SessionError>
where
    F: SendFallback + 'static,
{
    let established = connect_and_authenticate(&config).await?;

    let mut state = ClientState::default();
    for &room_id in &config.rooms {
        state.want_room(room_id);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (evt_tx, evt_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(run_session(
        config,
        fallback,
        state,
        established,
        cmd_rx,
        evt_tx,
    ));

    Ok((cmd_tx, evt_rx))
}

/// A freshly authenticated connection.
struct Established {
    sender: WsSender,
    reader: WsReader,
    user: UserProfile,
}

/// Connect, present the credential, and wait for the server's verdict.
///
/// The credential travels as the first frame; the server answers with
/// either `connected` or an error event before anything else.
async fn connect_and_authenticate(config: &SessionConfig) -> Result<Established, SessionError> {
    let url: url::Url = config.server_url.parse()?;

    let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| {
            warn!(url = %config.server_url, "connect timed out");
            SessionError::Timeout
        })??;

    let (mut sender, mut reader) = ws_stream.split();

    let hello = ClientEvent::Authenticate {
        credential: config.credential.clone(),
    };
    sender.send(Message::Text(codec::encode(&hello)?.into())).await?;

    let answer = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| {
            warn!(url = %config.server_url, "handshake timed out");
            SessionError::Timeout
        })?;

    match answer {
        Some(Ok(Message::Text(text))) => match codec::decode::<ServerEvent>(text.as_str())? {
            ServerEvent::Connected { user } => {
                info!(user_id = %user.id, name = %user.name, "session authenticated");
                Ok(Established {
                    sender,
                    reader,
                    user,
                })
            }
            ServerEvent::Error { message, code } => {
                warn!(%code, %message, "authentication rejected");
                Err(SessionError::AuthenticationRejected(message))
            }
            other => Err(SessionError::AuthenticationRejected(format!(
                "unexpected handshake answer: {other:?}"
            ))),
        },
        Some(Ok(Message::Close(_))) | None => Err(SessionError::HandshakeClosed),
        Some(Ok(_)) => Err(SessionError::AuthenticationRejected(
            "non-text handshake frame".to_string(),
        )),
        Some(Err(e)) => Err(e.into()),
    }
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionOutcome {
    /// Transport dropped; try to reconnect.
    Dropped,
    /// The server evicted us; do not reconnect.
    Evicted,
    /// The caller asked to stop or went away.
    Stopped,
}

/// Outer session loop: drive one connection at a time, reconnecting
/// between them until something terminal happens.
async fn run_session<F>(
    config: SessionConfig,
    fallback: F,
    mut state: ClientState,
    mut established: Established,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    evt_tx: mpsc::Sender<SessionEvent>,
) where
    F: SendFallback,
{
    let mut attempt: u32 = 0;

    loop {
        state.user = Some(established.user.clone());
        let connected = SessionEvent::Connected {
            user: established.user.clone(),
        };
        if evt_tx.send(connected).await.is_err() {
            return;
        }
        let connected_at = tokio::time::Instant::now();

        match run_connection(&config, &mut state, established, &mut cmd_rx, &evt_tx).await {
            ConnectionOutcome::Stopped => {
                info!("session stopped");
                return;
            }
            ConnectionOutcome::Evicted => {
                info!("session ended by the server");
                return;
            }
            ConnectionOutcome::Dropped => {
                warn!("connection to the server lost");
                if evt_tx.send(SessionEvent::Disconnected).await.is_err() {
                    return;
                }
                for (room_id, content) in state.fail_pending() {
                    debug!(%room_id, chars = content.chars().count(), "abandoning unacknowledged send");
                    let failed = SessionEvent::SendFailed {
                        room_id,
                        reason: "connection lost before acknowledgment".to_string(),
                    };
                    if evt_tx.send(failed).await.is_err() {
                        return;
                    }
                }

                // A connection that held long enough earns a fresh
                // attempt budget; a flapping one burns through it.
                if connected_at.elapsed() >= config.reconnect.stability_threshold {
                    attempt = 0;
                }
                match reconnect(&config, &fallback, &mut state, &mut attempt, &mut cmd_rx, &evt_tx)
                    .await
                {
                    ReconnectOutcome::Restored(next) => established = next,
                    ReconnectOutcome::Exhausted => {
                        warn!(
                            attempts = config.reconnect.max_attempts,
                            "giving up on reconnecting"
                        );
                        let _ = evt_tx.send(SessionEvent::ReconnectFailed).await;
                        return;
                    }
                    ReconnectOutcome::Stopped => return,
                }
            }
        }
    }
}

/// Drive a single live connection until it ends.
async fn run_connection(
    config: &SessionConfig,
    state: &mut ClientState,
    established: Established,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    evt_tx: &mpsc::Sender<SessionEvent>,
) -> ConnectionOutcome {
    let Established {
        mut sender,
        mut reader,
        ..
    } = established;

    if let Err(e) = replay_rooms(state, &mut sender).await {
        warn!(err = %e, "failed to replay room membership");
        return ConnectionOutcome::Dropped;
    }

    let mut keepalive = tokio::time::interval(config.reconnect.ping_interval);
    keepalive.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else {
                    let _ = sender.send(Message::Close(None)).await;
                    return ConnectionOutcome::Stopped;
                };
                if matches!(cmd, SessionCommand::Shutdown) {
                    let _ = sender.send(Message::Close(None)).await;
                    return ConnectionOutcome::Stopped;
                }
                if let Err(e) = forward_command(state, &mut sender, cmd).await {
                    warn!(err = %e, "failed to send frame");
                    return ConnectionOutcome::Dropped;
                }
            }
            maybe_frame = reader.next() => {
                match maybe_frame {
                    Some(Ok(Message::Text(text))) => {
                        match codec::decode::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                let terminal =
                                    matches!(event, ServerEvent::ForceDisconnect { .. });
                                for out in state.apply_server_event(event) {
                                    if evt_tx.send(out).await.is_err() {
                                        return ConnectionOutcome::Stopped;
                                    }
                                }
                                if terminal {
                                    return ConnectionOutcome::Evicted;
                                }
                            }
                            Err(e) => {
                                warn!(err = %e, "discarding malformed server frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnectionOutcome::Dropped,
                    Some(Ok(_)) => {
                        // Control and binary frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        warn!(err = %e, "websocket read error");
                        return ConnectionOutcome::Dropped;
                    }
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = send_frame(&mut sender, &ClientEvent::Ping { payload: None }).await {
                    warn!(err = %e, "keepalive failed");
                    return ConnectionOutcome::Dropped;
                }
            }
        }
    }
}

/// Announce every wanted room on a fresh connection: one resume frame
/// for rooms with a replay cursor, plain joins for the rest.
async fn replay_rooms(state: &ClientState, sender: &mut WsSender) -> Result<(), SessionError> {
    let (resume, joins) = state.rejoin_plan();
    if !resume.is_empty() {
        debug!(rooms = resume.len(), "resuming rooms");
        send_frame(sender, &ClientEvent::Resume { rooms: resume }).await?;
    }
    for room_id in joins {
        send_frame(sender, &ClientEvent::JoinRoom {
            room_id: Some(room_id),
        })
        .await?;
    }
    Ok(())
}

/// Translate a caller command into a wire frame and send it.
async fn forward_command(
    state: &mut ClientState,
    sender: &mut WsSender,
    cmd: SessionCommand,
) -> Result<(), SessionError> {
    let frame = match cmd {
        SessionCommand::Join { room_id } => {
            state.want_room(room_id);
            ClientEvent::JoinRoom {
                room_id: Some(room_id),
            }
        }
        SessionCommand::Leave { room_id } => {
            state.unwant_room(room_id);
            ClientEvent::LeaveRoom {
                room_id: Some(room_id),
            }
        }
        SessionCommand::Send { room_id, content } => {
            state.record_pending(room_id, content.clone());
            ClientEvent::SendMessage {
                room_id: Some(room_id),
                content: Some(content),
            }
        }
        SessionCommand::Typing { room_id, is_typing } => ClientEvent::Typing {
            room_id: Some(room_id),
            is_typing: Some(is_typing),
        },
        SessionCommand::MarkRead { room_id } => ClientEvent::MarkMessagesRead {
            room_id: Some(room_id),
        },
        // Handled by the connection loop before frames are built.
        SessionCommand::Shutdown => return Ok(()),
    };
    send_frame(sender, &frame).await
}

async fn send_frame(sender: &mut WsSender, frame: &ClientEvent) -> Result<(), SessionError> {
    let text = codec::encode(frame)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}

/// How a reconnection round ended.
enum ReconnectOutcome {
    /// A new connection is up and authenticated.
    Restored(Established),
    /// The attempt budget is spent or the credential went bad.
    Exhausted,
    /// The caller asked to stop or went away.
    Stopped,
}

/// Try to restore the connection with capped doubling backoff.
///
/// `attempt` carries across calls so a flapping link exhausts the
/// budget instead of retrying forever. Commands arriving during the
/// backoff wait are serviced offline.
async fn reconnect<F>(
    config: &SessionConfig,
    fallback: &F,
    state: &mut ClientState,
    attempt: &mut u32,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    evt_tx: &mpsc::Sender<SessionEvent>,
) -> ReconnectOutcome
where
    F: SendFallback,
{
    loop {
        *attempt += 1;
        if *attempt > config.reconnect.max_attempts {
            return ReconnectOutcome::Exhausted;
        }

        let deadline = tokio::time::Instant::now() + backoff_delay(&config.reconnect, *attempt);
        if !wait_or_service(deadline, fallback, state, cmd_rx, evt_tx).await {
            return ReconnectOutcome::Stopped;
        }

        let reconnecting = SessionEvent::Reconnecting {
            attempt: *attempt,
            max_attempts: config.reconnect.max_attempts,
        };
        if evt_tx.send(reconnecting).await.is_err() {
            return ReconnectOutcome::Stopped;
        }

        match connect_and_authenticate(config).await {
            Ok(established) => return ReconnectOutcome::Restored(established),
            Err(SessionError::AuthenticationRejected(reason)) => {
                // A rejected credential will not improve with retries.
                warn!(%reason, "reauthentication rejected");
                return ReconnectOutcome::Exhausted;
            }
            Err(e) => {
                warn!(attempt = *attempt, err = %e, "reconnect attempt failed");
            }
        }
    }
}

/// Sleep until `deadline`, servicing commands that arrive meanwhile.
/// Returns `false` when the session should stop.
async fn wait_or_service<F>(
    deadline: tokio::time::Instant,
    fallback: &F,
    state: &mut ClientState,
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    evt_tx: &mpsc::Sender<SessionEvent>,
) -> bool
where
    F: SendFallback,
{
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return true,
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { return false };
                if !handle_offline_command(fallback, state, evt_tx, cmd).await {
                    return false;
                }
            }
        }
    }
}

/// Handle a command while no connection exists. Sends go through the
/// fallback; room intent changes are remembered for the next connection.
async fn handle_offline_command<F>(
    fallback: &F,
    state: &mut ClientState,
    evt_tx: &mpsc::Sender<SessionEvent>,
    cmd: SessionCommand,
) -> bool
where
    F: SendFallback,
{
    match cmd {
        SessionCommand::Shutdown => return false,
        SessionCommand::Join { room_id } => {
            state.want_room(room_id);
        }
        SessionCommand::Leave { room_id } => {
            state.unwant_room(room_id);
            if evt_tx
                .send(SessionEvent::RoomLeft { room_id })
                .await
                .is_err()
            {
                return false;
            }
        }
        SessionCommand::Send { room_id, content } => {
            let result = match state.user.clone() {
                Some(user) => fallback.create_message(room_id, &user, &content).await,
                None => Err(FallbackError::Unavailable),
            };
            let out = match result {
                Ok(record) => {
                    if !state.merge_local_echo(&record) {
                        return true;
                    }
                    SessionEvent::MessageAcked {
                        room_id,
                        message: record,
                    }
                }
                Err(e) => {
                    debug!(%room_id, err = %e, "offline send failed");
                    SessionEvent::SendFailed {
                        room_id,
                        reason: e.to_string(),
                    }
                }
            };
            if evt_tx.send(out).await.is_err() {
                return false;
            }
        }
        SessionCommand::Typing { .. } | SessionCommand::MarkRead { .. } => {
            debug!("dropping ephemeral command while disconnected");
        }
    }
    true
}
