//! Chat gateway: shared state, WebSocket handshake and connection
//! lifecycle.
//!
//! Every connection goes through the same sequence:
//! 1. Resolve a credential (`Authorization` header, `token` query
//!    parameter, or a first-frame `authenticate` event) and check it
//!    against the user directory.
//! 2. Register the connection and send `connected`.
//! 3. Spawn a writer task draining the connection's event channel.
//! 4. Run the reader loop, dispatching decoded client events.
//! 5. On disconnect, tear down presence, typing timers and the
//!    registry entry, notifying affected rooms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};

use huddle_proto::codec;
use huddle_proto::event::{ClientEvent, ErrorCode, ServerEvent};
use huddle_proto::ids::{ConnectionId, RoomId, UserId};
use huddle_proto::room::LeaveReason;
use huddle_proto::user::UserProfile;

use crate::auth::{AuthError, Authenticator};
use crate::dispatch;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::services::{MessageStore, RoomDirectory, Services, UserDirectory};
use crate::supervisor;
use crate::typing::TypingScheduler;

/// Default time a connection gets to present a first-frame credential.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default debounce window before a typing indicator auto-clears.
pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_secs(3);

/// Default inactivity threshold before a connection is evicted.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(300);

/// Default interval between idle-connection sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on messages replayed per room when resuming a session.
pub const DEFAULT_RESUME_GAP_LIMIT: usize = 100;

/// Tunable timing and limit knobs for the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// How long to wait for a first-frame credential.
    pub auth_timeout: Duration,
    /// Debounce window for typing indicators.
    pub typing_window: Duration,
    /// Inactivity threshold for eviction.
    pub idle_threshold: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// Maximum messages replayed per resumed room.
    pub resume_gap_limit: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            typing_window: DEFAULT_TYPING_WINDOW,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            resume_gap_limit: DEFAULT_RESUME_GAP_LIMIT,
        }
    }
}

/// Shared server state: connection registry, presence, typing timers
/// and the backing services.
pub struct ChatState<R, M, U> {
    /// Live connection table.
    pub registry: ConnectionRegistry,
    /// Per-room presence.
    pub presence: PresenceTracker,
    /// Pending typing auto-clear timers.
    pub typing: TypingScheduler,
    /// Backing services (rooms, history, users).
    pub services: Services<R, M, U>,
    /// Credential verifier.
    pub authenticator: Authenticator,
    /// Timing and limit knobs.
    pub settings: GatewaySettings,
    /// Per-room locks serializing persist-then-broadcast sections.
    room_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
}

impl<R, M, U> ChatState<R, M, U>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    /// Creates state with default settings.
    pub fn new(authenticator: Authenticator, services: Services<R, M, U>) -> Self {
        Self::with_settings(authenticator, services, GatewaySettings::default())
    }

    /// Creates state with explicit settings.
    pub fn with_settings(
        authenticator: Authenticator,
        services: Services<R, M, U>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            presence: PresenceTracker::new(),
            typing: TypingScheduler::new(),
            services,
            authenticator,
            settings,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the ordering lock for a room, creating it on first use.
    pub(crate) async fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.room_locks
                .lock()
                .await
                .entry(room_id)
                .or_default(),
        )
    }

    /// Drops the ordering lock for a room whose presence emptied.
    pub(crate) async fn prune_room_lock(&self, room_id: RoomId) {
        self.room_locks.lock().await.remove(&room_id);
    }

    /// Fans an event out to every connection present in a room, except
    /// an optional originator. Returns the number of deliveries.
    pub async fn broadcast_room(
        &self,
        room_id: RoomId,
        except: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let mut delivered = 0;
        for conn_id in self.presence.connections_in(room_id).await {
            if Some(conn_id) == except {
                continue;
            }
            if self.registry.send_to(conn_id, event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Handles an upgraded WebSocket connection.
pub async fn handle_socket<R, M, U>(
    socket: WebSocket,
    state: Arc<ChatState<R, M, U>>,
    header_credential: Option<String>,
    query_credential: Option<String>,
) where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Resolve an identity before anything else may happen.
    let user = match authenticate(&state, &mut ws_receiver, header_credential, query_credential)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "connection rejected");
            let reject = ServerEvent::Error {
                message: e.to_string(),
                code: ErrorCode::AuthenticationError,
            };
            if let Ok(text) = codec::encode(&reject) {
                let _ = ws_sender.send(Message::Text(text.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let conn_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry.register(conn_id, user.clone(), tx).await;
    tracing::info!(connection_id = %conn_id, user_id = %user.id, "connection authenticated");

    // The handshake ack rides the same channel as everything else, so
    // it is always the first event the client observes.
    state
        .registry
        .send_to(conn_id, ServerEvent::Connected { user: user.clone() })
        .await;

    // Writer task: drain the connection's channel onto the socket.
    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match codec::encode(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        tracing::warn!(connection_id = %conn_id, "WebSocket write failed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(connection_id = %conn_id, error = %e, "failed to encode event");
                }
            }
        }
        // Channel closed: either the registry entry is gone or the
        // reader side ended. Say goodbye properly.
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Reader loop: decode frames and dispatch them.
    let reader_state = Arc::clone(&state);
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    reader_state.registry.touch(conn_id).await;
                    match codec::decode::<ClientEvent>(text.as_str()) {
                        Ok(event) => {
                            dispatch::handle_client_event(
                                &reader_state,
                                conn_id,
                                &reader_user,
                                event,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::warn!(
                                connection_id = %conn_id,
                                error = %e,
                                "dropping malformed frame"
                            );
                            reader_state
                                .registry
                                .send_to(
                                    conn_id,
                                    ServerEvent::Error {
                                        message: e.to_string(),
                                        code: ErrorCode::SocketError,
                                    },
                                )
                                .await;
                        }
                    }
                }
                Message::Close(_) => {
                    tracing::debug!(connection_id = %conn_id, "received close frame");
                    break;
                }
                _ => {
                    // Binary, ping and pong frames carry no events.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    dispatch::teardown_connection(&state, conn_id, LeaveReason::Disconnected).await;
}

/// Resolves the connection's identity from whichever credential channel
/// the client used.
///
/// A header or query credential is checked immediately. Without either,
/// the server waits up to `auth_timeout` for a first-frame
/// `authenticate` event.
async fn authenticate<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    header_credential: Option<String>,
    query_credential: Option<String>,
) -> Result<UserProfile, AuthError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    if let Some(credential) = header_credential {
        return resolve_user(state, &credential).await;
    }
    if let Some(credential) = query_credential {
        return resolve_user(state, &credential).await;
    }

    let first_frame = tokio::time::timeout(state.settings.auth_timeout, async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => {
                    // Skip control frames while waiting for the credential.
                }
            }
        }
        None
    })
    .await;

    match first_frame {
        Ok(Some(text)) => match codec::decode::<ClientEvent>(text.as_str()) {
            Ok(ClientEvent::Authenticate { credential }) => {
                resolve_user(state, &credential).await
            }
            Ok(other) => {
                tracing::warn!(event = ?other, "first frame is not an authenticate event");
                Err(AuthError::MissingCredential)
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame before authentication");
                Err(AuthError::MissingCredential)
            }
        },
        Ok(None) => Err(AuthError::MissingCredential),
        Err(_) => Err(AuthError::MissingCredential),
    }
}

/// Verifies a credential and checks the user it names against the
/// directory.
async fn resolve_user<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    credential: &str,
) -> Result<UserProfile, AuthError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let claims = state.authenticator.verify(credential)?;
    let user_id = UserId::new(claims.sub);
    let record = state
        .services
        .users
        .lookup(user_id)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?;
    match record {
        Some(record) if record.active => Ok(record.profile),
        _ => Err(AuthError::UnknownOrInactiveUser),
    }
}

/// Extracts a bearer credential from the request headers.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(ToOwned::to_owned)
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler<R, M, U>(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<ChatState<R, M, U>>>,
) -> impl axum::response::IntoResponse
where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    let header_credential = bearer_token(&headers);
    let query_credential = params.get("token").cloned();
    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, header_credential, query_credential)
    })
}

/// Starts the chat server with a pre-configured [`ChatState`] and
/// returns the bound address and a join handle.
///
/// Also spawns the idle sweeper for the lifetime of the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given
/// address.
pub async fn start_server_with_state<R, M, U>(
    addr: &str,
    state: Arc<ChatState<R, M, U>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
>
where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<R, M, U>))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let sweeper = supervisor::spawn_sweeper(Arc::clone(&state));
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "chat server error");
        }
        sweeper.abort();
    });

    Ok((bound_addr, handle))
}
