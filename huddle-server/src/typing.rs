//! Debounce timers for typing indicators.
//!
//! At most one auto-clear timer exists per (room, user). Re-typing
//! replaces the running timer, an explicit stop or a teardown aborts
//! it, and the timer task deregisters itself when it fires.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use huddle_proto::ids::{RoomId, UserId};

/// Tracks pending typing auto-clear timers.
#[derive(Debug, Default)]
pub struct TypingScheduler {
    timers: Mutex<HashMap<(RoomId, UserId), JoinHandle<()>>>,
}

impl TypingScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the auto-clear timer for (room, user), aborting any
    /// timer already pending for that key.
    pub async fn set(&self, room_id: RoomId, user_id: UserId, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert((room_id, user_id), handle) {
            old.abort();
        }
    }

    /// Aborts and removes the pending timer for (room, user), if any.
    /// Returns whether a timer was pending.
    pub async fn clear(&self, room_id: RoomId, user_id: UserId) -> bool {
        match self.timers.lock().await.remove(&(room_id, user_id)) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drops the bookkeeping for a timer that has fired. Called by the
    /// timer task itself, so the handle is not aborted.
    pub async fn finish(&self, room_id: RoomId, user_id: UserId) {
        self.timers.lock().await.remove(&(room_id, user_id));
    }

    /// Returns whether a timer is pending for (room, user).
    pub async fn is_pending(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.timers.lock().await.contains_key(&(room_id, user_id))
    }

    /// Number of pending timers across all rooms.
    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}
