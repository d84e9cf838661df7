//! Client event dispatch.
//!
//! [`handle_client_event`] routes every decoded frame to its handler.
//! Handlers validate and authorize completely before mutating any state,
//! perform their effects through [`ChatState`], and report failures as
//! `error` events with stable codes to the offending connection. They
//! run directly against the shared state and per-connection channels,
//! so tests drive them without a live socket.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_proto::event::{ClientEvent, ErrorCode, ResumeRoom, ServerEvent};
use huddle_proto::ids::{ConnectionId, RoomId, Timestamp, UserId};
use huddle_proto::message::{MessageRecord, ValidationError, validate_content};
use huddle_proto::room::LeaveReason;
use huddle_proto::user::UserProfile;

use crate::gateway::ChatState;
use crate::services::{MessageStore, NewMessage, RoomDirectory, RoomRecord, StoreError, UserDirectory};

/// A rejected client operation, carrying what the resulting `error`
/// event will say.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    /// Stable wire code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl DispatchError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn missing_room_id() -> Self {
        Self::new(ErrorCode::MissingRoomId, "roomId is required")
    }

    fn access_denied(room_id: RoomId) -> Self {
        Self::new(
            ErrorCode::RoomAccessDenied,
            format!("not a participant of room {room_id}"),
        )
    }

    fn store(code: ErrorCode, source: &StoreError) -> Self {
        Self::new(code, source.to_string())
    }
}

impl From<ValidationError> for DispatchError {
    fn from(e: ValidationError) -> Self {
        let code = match e {
            ValidationError::Empty => ErrorCode::InvalidMessageData,
            ValidationError::TooLong { .. } => ErrorCode::MessageTooLong,
        };
        Self::new(code, e.to_string())
    }
}

/// Dispatches one decoded client event on behalf of a registered
/// connection.
pub async fn handle_client_event<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    event: ClientEvent,
) where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    let result = match event {
        ClientEvent::Authenticate { .. } => {
            tracing::warn!(
                connection_id = %conn_id,
                user_id = %user.id,
                "ignoring authenticate on an established connection"
            );
            Ok(())
        }
        ClientEvent::JoinRoom { room_id } => handle_join(state, conn_id, user, room_id).await,
        ClientEvent::LeaveRoom { room_id } => handle_leave(state, conn_id, user, room_id).await,
        ClientEvent::SendMessage { room_id, content } => {
            handle_send(state, conn_id, user, room_id, content).await
        }
        ClientEvent::Typing { room_id, is_typing } => {
            handle_typing(state, conn_id, user, room_id, is_typing).await
        }
        ClientEvent::MarkMessagesRead { room_id } => {
            handle_mark_read(state, conn_id, user, room_id).await
        }
        ClientEvent::Ping { payload } => handle_ping(state, conn_id, payload).await,
        ClientEvent::Resume { rooms } => handle_resume(state, conn_id, user, rooms).await,
    };

    if let Err(reject) = result {
        tracing::warn!(
            connection_id = %conn_id,
            user_id = %user.id,
            code = %reject.code,
            error = %reject,
            "client operation rejected"
        );
        state
            .registry
            .send_to(
                conn_id,
                ServerEvent::Error {
                    message: reject.message,
                    code: reject.code,
                },
            )
            .await;
    }
}

/// Looks a room up and checks the user may enter it. Unknown, inactive
/// and non-member rooms are all reported as access denied.
async fn authorized_room<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    user_id: UserId,
    room_id: RoomId,
) -> Result<RoomRecord, DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let record = state
        .services
        .rooms
        .room(room_id)
        .await
        .map_err(|e| DispatchError::store(ErrorCode::JoinRoomError, &e))?
        .ok_or_else(|| DispatchError::access_denied(room_id))?;
    if !record.summary.active || !record.participant_ids.contains(&user_id) {
        return Err(DispatchError::access_denied(room_id));
    }
    Ok(record)
}

async fn handle_join<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    room_id: Option<RoomId>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let room_id = room_id.ok_or_else(DispatchError::missing_room_id)?;
    let record = authorized_room(state, user.id, room_id).await?;

    state.registry.add_room(conn_id, room_id).await;
    let outcome = state.presence.join(room_id, user.id, conn_id).await;
    tracing::info!(
        connection_id = %conn_id,
        user_id = %user.id,
        room_id = %room_id,
        online = outcome.online_count,
        "joined room"
    );

    let participants = participant_profiles(state, &record.participant_ids).await;
    state
        .registry
        .send_to(
            conn_id,
            ServerEvent::RoomJoined {
                room: record.summary,
                participants,
                online_count: outcome.online_count,
            },
        )
        .await;

    // Peers only hear about the user's first connection in the room.
    if outcome.newly_present {
        state
            .broadcast_room(
                room_id,
                Some(conn_id),
                &ServerEvent::UserJoinedRoom {
                    room_id,
                    user: user.clone(),
                    online_count: outcome.online_count,
                },
            )
            .await;
    }
    Ok(())
}

async fn handle_leave<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    room_id: Option<RoomId>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let room_id = room_id.ok_or_else(DispatchError::missing_room_id)?;

    state.registry.remove_room(conn_id, room_id).await;
    let outcome = state.presence.leave(room_id, user.id, conn_id).await;
    state
        .registry
        .send_to(conn_id, ServerEvent::RoomLeft { room_id })
        .await;

    if let Some(outcome) = outcome {
        if outcome.user_left {
            state.typing.clear(room_id, user.id).await;
            state
                .broadcast_room(
                    room_id,
                    Some(conn_id),
                    &ServerEvent::UserLeftRoom {
                        room_id,
                        user_id: user.id,
                        reason: LeaveReason::Left,
                    },
                )
                .await;
        }
        if outcome.room_emptied {
            state.prune_room_lock(room_id).await;
        }
        tracing::info!(
            connection_id = %conn_id,
            user_id = %user.id,
            room_id = %room_id,
            online = outcome.online_count,
            "left room"
        );
    }
    Ok(())
}

async fn handle_send<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    room_id: Option<RoomId>,
    content: Option<String>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let room_id = room_id.ok_or_else(DispatchError::missing_room_id)?;
    let raw = content.ok_or_else(|| {
        DispatchError::new(ErrorCode::InvalidMessageData, "message content is required")
    })?;
    let text = validate_content(&raw)?;

    let member = state
        .services
        .rooms
        .is_participant(room_id, user.id)
        .await
        .map_err(|e| DispatchError::store(ErrorCode::SendMessageError, &e))?;
    if !member {
        return Err(DispatchError::access_denied(room_id));
    }

    // Persist and enqueue the fan-out under the room's ordering lock,
    // so concurrent sends broadcast in persistence order and the ack
    // never precedes its own broadcast.
    let lock = state.room_lock(room_id).await;
    let guard = lock.lock().await;

    let stored = state
        .services
        .store
        .create(NewMessage {
            room_id,
            sender_id: user.id,
            content: text.to_owned(),
        })
        .await
        .map_err(|e| DispatchError::store(ErrorCode::SendMessageError, &e))?;

    if let Err(e) = state.services.rooms.touch_room(room_id, stored.created_at).await {
        tracing::warn!(room_id = %room_id, error = %e, "failed to record room activity");
    }

    let message = MessageRecord {
        sender: sender_profile(state, user).await,
        ..stored.clone()
    };
    let delivered = state
        .broadcast_room(
            room_id,
            Some(conn_id),
            &ServerEvent::NewMessage { room_id, message },
        )
        .await;
    state
        .registry
        .send_to(
            conn_id,
            ServerEvent::MessageSent {
                message_id: stored.id,
                room_id,
                timestamp: stored.created_at,
            },
        )
        .await;
    drop(guard);

    state.registry.record_send(conn_id).await;
    tracing::debug!(
        connection_id = %conn_id,
        room_id = %room_id,
        message_id = %stored.id,
        delivered,
        "message dispatched"
    );
    Ok(())
}

async fn handle_typing<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    room_id: Option<RoomId>,
    is_typing: Option<bool>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    let room_id = room_id.ok_or_else(DispatchError::missing_room_id)?;
    let is_typing = is_typing.unwrap_or(false);

    // Typing is ephemeral: it only relays inside rooms this connection
    // has actually joined, and never fails loudly.
    if !state.registry.in_room(conn_id, room_id).await {
        tracing::debug!(
            connection_id = %conn_id,
            room_id = %room_id,
            "typing outside joined room dropped"
        );
        return Ok(());
    }

    if is_typing {
        state
            .broadcast_room(
                room_id,
                Some(conn_id),
                &ServerEvent::UserTyping {
                    room_id,
                    user_id: user.id,
                    is_typing: true,
                },
            )
            .await;

        let timer_state = Arc::clone(state);
        let user_id = user.id;
        let window = state.settings.typing_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            timer_state.typing.finish(room_id, user_id).await;
            timer_state
                .broadcast_room(
                    room_id,
                    Some(conn_id),
                    &ServerEvent::UserTyping {
                        room_id,
                        user_id,
                        is_typing: false,
                    },
                )
                .await;
        });
        state.typing.set(room_id, user.id, handle).await;
    } else {
        state.typing.clear(room_id, user.id).await;
        state
            .broadcast_room(
                room_id,
                Some(conn_id),
                &ServerEvent::UserTyping {
                    room_id,
                    user_id: user.id,
                    is_typing: false,
                },
            )
            .await;
    }
    Ok(())
}

async fn handle_mark_read<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    room_id: Option<RoomId>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let room_id = room_id.ok_or_else(DispatchError::missing_room_id)?;

    let member = state
        .services
        .rooms
        .is_participant(room_id, user.id)
        .await
        .map_err(|e| DispatchError::store(ErrorCode::MarkReadError, &e))?;
    if !member {
        return Err(DispatchError::access_denied(room_id));
    }

    let updated = state
        .services
        .store
        .mark_read(room_id, user.id)
        .await
        .map_err(|e| DispatchError::store(ErrorCode::MarkReadError, &e))?;

    state
        .broadcast_room(
            room_id,
            Some(conn_id),
            &ServerEvent::MessagesRead {
                room_id,
                user_id: user.id,
            },
        )
        .await;
    tracing::debug!(
        connection_id = %conn_id,
        room_id = %room_id,
        updated,
        "messages marked read"
    );
    Ok(())
}

async fn handle_ping<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    payload: Option<serde_json::Value>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    state
        .registry
        .send_to(
            conn_id,
            ServerEvent::Pong {
                payload,
                server_time_ms: Timestamp::now().as_millis(),
            },
        )
        .await;
    Ok(())
}

async fn handle_resume<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    rooms: Vec<ResumeRoom>,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    // Each room resumes independently; a rejection for one room does
    // not abort the rest.
    for entry in rooms {
        let room_id = entry.room_id;
        if let Err(reject) = resume_room(state, conn_id, user, entry).await {
            tracing::warn!(
                connection_id = %conn_id,
                user_id = %user.id,
                room_id = %room_id,
                code = %reject.code,
                "room resume rejected"
            );
            state
                .registry
                .send_to(
                    conn_id,
                    ServerEvent::Error {
                        message: reject.message,
                        code: reject.code,
                    },
                )
                .await;
        }
    }
    Ok(())
}

async fn resume_room<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    user: &UserProfile,
    entry: ResumeRoom,
) -> Result<(), DispatchError>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let room_id = entry.room_id;
    authorized_room(state, user.id, room_id).await?;

    let missed = match entry.last_seen_ms {
        Some(ms) => state
            .services
            .store
            .list_since(
                room_id,
                Timestamp::from_millis(ms),
                state.settings.resume_gap_limit,
            )
            .await
            .map_err(|e| DispatchError::store(ErrorCode::JoinRoomError, &e))?,
        None => Vec::new(),
    };
    let missed = enrich_messages(state, missed).await;

    state.registry.add_room(conn_id, room_id).await;
    let outcome = state.presence.join(room_id, user.id, conn_id).await;
    tracing::info!(
        connection_id = %conn_id,
        user_id = %user.id,
        room_id = %room_id,
        missed = missed.len(),
        "room resumed"
    );

    state
        .registry
        .send_to(
            conn_id,
            ServerEvent::RoomResumed {
                room_id,
                missed,
                online_count: outcome.online_count,
            },
        )
        .await;

    if outcome.newly_present {
        state
            .broadcast_room(
                room_id,
                Some(conn_id),
                &ServerEvent::UserJoinedRoom {
                    room_id,
                    user: user.clone(),
                    online_count: outcome.online_count,
                },
            )
            .await;
    }
    Ok(())
}

/// Fetches a fresh sender identity, falling back to the session profile
/// when the directory cannot help.
async fn sender_profile<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    user: &UserProfile,
) -> Option<UserProfile>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    match state.services.users.lookup(user.id).await {
        Ok(Some(record)) => Some(record.profile),
        Ok(None) => Some(user.clone()),
        Err(e) => {
            tracing::warn!(
                user_id = %user.id,
                error = %e,
                "sender enrichment failed, using session identity"
            );
            Some(user.clone())
        }
    }
}

/// Resolves participant profiles, skipping accounts the directory
/// cannot produce.
async fn participant_profiles<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    ids: &[UserId],
) -> Vec<UserProfile>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let mut profiles = Vec::with_capacity(ids.len());
    for &user_id in ids {
        match state.services.users.lookup(user_id).await {
            Ok(Some(record)) => profiles.push(record.profile),
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "participant missing from directory");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "participant lookup failed");
            }
        }
    }
    profiles
}

/// Attaches sender identities to replayed messages, one directory
/// lookup per distinct sender.
async fn enrich_messages<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    messages: Vec<MessageRecord>,
) -> Vec<MessageRecord>
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let mut cache: HashMap<UserId, Option<UserProfile>> = HashMap::new();
    let mut out = Vec::with_capacity(messages.len());
    for mut message in messages {
        let sender_id = message.sender_id;
        if !cache.contains_key(&sender_id) {
            let profile = match state.services.users.lookup(sender_id).await {
                Ok(Some(record)) => Some(record.profile),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(user_id = %sender_id, error = %e, "sender lookup failed");
                    None
                }
            };
            cache.insert(sender_id, profile);
        }
        message.sender = cache.get(&sender_id).cloned().flatten();
        out.push(message);
    }
    out
}

/// Removes a connection and unwinds everything it touched: presence in
/// every joined room, typing timers and the registry entry. Safe to
/// call more than once.
pub async fn teardown_connection<R, M, U>(
    state: &Arc<ChatState<R, M, U>>,
    conn_id: ConnectionId,
    reason: LeaveReason,
) where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let Some(entry) = state.registry.unregister(conn_id).await else {
        return;
    };

    for room_id in entry.rooms.iter().copied() {
        state.typing.clear(room_id, entry.user.id).await;
        if let Some(outcome) = state.presence.leave(room_id, entry.user.id, conn_id).await {
            if outcome.user_left {
                state
                    .broadcast_room(
                        room_id,
                        None,
                        &ServerEvent::UserLeftRoom {
                            room_id,
                            user_id: entry.user.id,
                            reason,
                        },
                    )
                    .await;
            }
            if outcome.room_emptied {
                state.prune_room_lock(room_id).await;
            }
        }
    }

    tracing::info!(
        connection_id = %conn_id,
        user_id = %entry.user.id,
        rooms = entry.rooms.len(),
        messages_sent = entry.messages_sent,
        reason = %reason,
        "connection closed"
    );
}
