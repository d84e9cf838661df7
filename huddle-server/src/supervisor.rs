//! Idle connection supervision.
//!
//! A background sweeper walks the registry on a fixed cadence and
//! evicts connections that have produced no traffic for longer than
//! the idle threshold. Evicted clients are told why before their
//! channel closes, so well-behaved ones do not reconnect on their own.

use std::sync::Arc;

use huddle_proto::event::ServerEvent;
use huddle_proto::ids::Timestamp;
use huddle_proto::room::LeaveReason;

use crate::dispatch::teardown_connection;
use crate::gateway::ChatState;
use crate::services::{MessageStore, RoomDirectory, UserDirectory};

/// What an evicted client is told.
pub const IDLE_DISCONNECT_REASON: &str = "idle timeout";

/// Spawns the background task that periodically evicts idle
/// connections.
///
/// The task runs every `sweep_interval` and stops when the returned
/// [`tokio::task::JoinHandle`] is aborted or the runtime shuts down.
pub fn spawn_sweeper<R, M, U>(state: Arc<ChatState<R, M, U>>) -> tokio::task::JoinHandle<()>
where
    R: RoomDirectory + 'static,
    M: MessageStore + 'static,
    U: UserDirectory + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.settings.sweep_interval);
        loop {
            tick.tick().await;
            let evicted = sweep_idle(&state).await;
            if evicted > 0 {
                tracing::info!(evicted, "idle sweep complete");
            }
        }
    })
}

/// Evicts every connection that has been idle past the configured
/// threshold. Returns how many were closed.
pub async fn sweep_idle<R, M, U>(state: &Arc<ChatState<R, M, U>>) -> usize
where
    R: RoomDirectory,
    M: MessageStore,
    U: UserDirectory,
{
    let now = Timestamp::now();
    let stale = state
        .registry
        .idle_since(state.settings.idle_threshold, now)
        .await;
    let count = stale.len();

    for (conn_id, user_id) in stale {
        tracing::info!(
            connection_id = %conn_id,
            user_id = %user_id,
            "evicting idle connection"
        );
        // The notice is enqueued before teardown drops the channel, so
        // it still reaches the writer.
        state
            .registry
            .send_to(
                conn_id,
                ServerEvent::ForceDisconnect {
                    reason: IDLE_DISCONNECT_REASON.to_owned(),
                },
            )
            .await;
        teardown_connection(state, conn_id, LeaveReason::Idle).await;
    }
    count
}
