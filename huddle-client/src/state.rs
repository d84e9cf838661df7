//! Client-side session state.
//!
//! [`ClientState`] tracks which rooms the session wants to be in, which
//! messages it has seen and which sends are still waiting for their
//! acknowledgment. Incoming server frames are folded in through
//! [`ClientState::apply_server_event`], which returns the resulting
//! [`SessionEvent`]s. Nothing in this module touches the network, so the
//! transitions are testable on their own.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use huddle_proto::event::{ResumeRoom, ServerEvent};
use huddle_proto::ids::{MessageId, RoomId};
use huddle_proto::message::MessageRecord;
use huddle_proto::room::RoomSummary;
use huddle_proto::user::UserProfile;

use crate::session::SessionEvent;

/// Ceiling for the duplicate-suppression set. The set is cleared once it
/// fills; a briefly empty set only risks re-surfacing a very old replay.
const MAX_SEEN_IDS: usize = 10_000;

/// What the session knows about one joined room.
#[derive(Debug, Default)]
pub struct RoomView {
    /// Latest room metadata confirmed by the server, if any.
    pub summary: Option<RoomSummary>,
    /// Last reported number of users present.
    pub online_count: usize,
    /// Creation time of the newest message seen in the room.
    pub last_seen_ms: Option<u64>,
    /// Contents of sends awaiting acknowledgment, oldest first.
    pub pending: VecDeque<String>,
}

/// Session-wide client state, owned by the session task.
#[derive(Debug, Default)]
pub struct ClientState {
    /// Identity confirmed by the server on connect.
    pub user: Option<UserProfile>,
    /// Rooms the session intends to be in. Survives reconnects.
    wanted: BTreeSet<RoomId>,
    /// Per-room views, keyed by room.
    rooms: HashMap<RoomId, RoomView>,
    /// Recently seen message ids, for duplicate suppression.
    seen: HashSet<MessageId>,
}

impl ClientState {
    /// Marks a room as one this session should be in.
    pub fn want_room(&mut self, room_id: RoomId) {
        self.wanted.insert(room_id);
    }

    /// Drops a room from the session's intent and forgets its view.
    pub fn unwant_room(&mut self, room_id: RoomId) {
        self.wanted.remove(&room_id);
        self.rooms.remove(&room_id);
    }

    /// Returns the view of a room, if the session has one.
    #[must_use]
    pub fn room(&self, room_id: RoomId) -> Option<&RoomView> {
        self.rooms.get(&room_id)
    }

    /// Remembers an outbound message until its acknowledgment arrives.
    pub fn record_pending(&mut self, room_id: RoomId, content: String) {
        self.rooms
            .entry(room_id)
            .or_default()
            .pending
            .push_back(content);
    }

    /// Drains every unacknowledged send, oldest first per room, so the
    /// caller can report them as failed after a connection loss.
    pub fn fail_pending(&mut self) -> Vec<(RoomId, String)> {
        let mut room_ids: Vec<RoomId> = self.rooms.keys().copied().collect();
        room_ids.sort_unstable();

        let mut failed = Vec::new();
        for room_id in room_ids {
            if let Some(view) = self.rooms.get_mut(&room_id) {
                failed.extend(view.pending.drain(..).map(|content| (room_id, content)));
            }
        }
        failed
    }

    /// Splits the wanted rooms into those with a replay cursor (rejoined
    /// with a `resume` frame) and those never joined on this session
    /// (joined plainly, so the server answers with full room metadata).
    #[must_use]
    pub fn rejoin_plan(&self) -> (Vec<ResumeRoom>, Vec<RoomId>) {
        let mut resume = Vec::new();
        let mut joins = Vec::new();
        for &room_id in &self.wanted {
            match self.rooms.get(&room_id).and_then(|view| view.last_seen_ms) {
                Some(last_seen_ms) => resume.push(ResumeRoom {
                    room_id,
                    last_seen_ms: Some(last_seen_ms),
                }),
                None => joins.push(room_id),
            }
        }
        (resume, joins)
    }

    /// Folds a message persisted through an offline fallback into the
    /// session, so a later live broadcast of the same message is not
    /// surfaced twice. Returns `false` if the message was already known.
    pub fn merge_local_echo(&mut self, message: &MessageRecord) -> bool {
        self.note_message(message.room_id, message)
    }

    /// Folds one server frame into the state and returns the events the
    /// caller should surface, in order.
    pub fn apply_server_event(&mut self, event: ServerEvent) -> Vec<SessionEvent> {
        match event {
            ServerEvent::Connected { user } => {
                self.user = Some(user.clone());
                vec![SessionEvent::Connected { user }]
            }
            ServerEvent::RoomJoined {
                room,
                participants,
                online_count,
            } => {
                self.wanted.insert(room.id);
                let view = self.rooms.entry(room.id).or_default();
                view.summary = Some(room.clone());
                view.online_count = online_count;
                vec![SessionEvent::RoomJoined {
                    room,
                    participants,
                    online_count,
                }]
            }
            ServerEvent::RoomLeft { room_id } => {
                self.unwant_room(room_id);
                vec![SessionEvent::RoomLeft { room_id }]
            }
            ServerEvent::RoomResumed {
                room_id,
                missed,
                online_count,
            } => {
                self.wanted.insert(room_id);
                self.rooms.entry(room_id).or_default().online_count = online_count;

                let mut fresh = Vec::new();
                for message in missed {
                    if self.note_message(room_id, &message) {
                        fresh.push(message);
                    }
                }
                let mut events = vec![SessionEvent::RoomRejoined {
                    room_id,
                    recovered: fresh.len(),
                    online_count,
                }];
                events.extend(
                    fresh
                        .into_iter()
                        .map(|message| SessionEvent::MessageReceived { room_id, message }),
                );
                events
            }
            ServerEvent::NewMessage { room_id, message } => {
                if self.note_message(room_id, &message) {
                    vec![SessionEvent::MessageReceived { room_id, message }]
                } else {
                    debug!(message_id = %message.id, "duplicate message dropped");
                    Vec::new()
                }
            }
            ServerEvent::MessageSent {
                message_id,
                room_id,
                timestamp,
            } => {
                self.mark_seen(message_id);
                self.advance_cursor(room_id, timestamp.as_millis());
                let content = self
                    .rooms
                    .get_mut(&room_id)
                    .and_then(|view| view.pending.pop_front());
                match (content, self.user.clone()) {
                    (Some(content), Some(user)) => {
                        let message = MessageRecord {
                            id: message_id,
                            room_id,
                            sender_id: user.id,
                            content,
                            read: false,
                            created_at: timestamp,
                            sender: Some(user),
                        };
                        vec![SessionEvent::MessageAcked { room_id, message }]
                    }
                    // An ack with nothing pending has nothing to surface.
                    _ => Vec::new(),
                }
            }
            ServerEvent::UserJoinedRoom {
                room_id,
                user,
                online_count,
            } => {
                if let Some(view) = self.rooms.get_mut(&room_id) {
                    view.online_count = online_count;
                }
                vec![SessionEvent::PeerJoined {
                    room_id,
                    user,
                    online_count,
                }]
            }
            ServerEvent::UserLeftRoom {
                room_id,
                user_id,
                reason,
            } => {
                if let Some(view) = self.rooms.get_mut(&room_id) {
                    view.online_count = view.online_count.saturating_sub(1);
                }
                vec![SessionEvent::PeerLeft {
                    room_id,
                    user_id,
                    reason,
                }]
            }
            ServerEvent::UserTyping {
                room_id,
                user_id,
                is_typing,
            } => vec![SessionEvent::PeerTyping {
                room_id,
                user_id,
                is_typing,
            }],
            ServerEvent::MessagesRead { room_id, user_id } => {
                vec![SessionEvent::MessagesRead { room_id, user_id }]
            }
            ServerEvent::Pong { server_time_ms, .. } => {
                debug!(server_time_ms, "pong");
                Vec::new()
            }
            ServerEvent::Error { message, code } => {
                vec![SessionEvent::ServerError { code, message }]
            }
            ServerEvent::ForceDisconnect { reason } => {
                vec![SessionEvent::Evicted { reason }]
            }
        }
    }

    /// Records a message sighting. Returns `false` for duplicates.
    fn note_message(&mut self, room_id: RoomId, message: &MessageRecord) -> bool {
        if self.seen.contains(&message.id) {
            return false;
        }
        self.mark_seen(message.id);
        self.advance_cursor(room_id, message.created_at.as_millis());
        true
    }

    fn mark_seen(&mut self, id: MessageId) {
        if self.seen.len() >= MAX_SEEN_IDS {
            self.seen.clear();
        }
        self.seen.insert(id);
    }

    fn advance_cursor(&mut self, room_id: RoomId, created_ms: u64) {
        let view = self.rooms.entry(room_id).or_default();
        if view.last_seen_ms.is_none_or(|seen| created_ms > seen) {
            view.last_seen_ms = Some(created_ms);
        }
    }
}
