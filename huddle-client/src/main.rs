//! Huddle console client.
//!
//! Connects to a huddle server, joins rooms, and prints the conversation
//! line by line. Stdin drives it:
//!
//! - `/join <room-id>` joins a room and makes it the active one
//! - `/leave <room-id>` leaves a room
//! - `/read <room-id>` marks a room's messages as read
//! - `/quit` exits
//! - anything else is sent to the active room
//!
//! ```bash
//! # Mint a credential on the server side, then:
//! cargo run --bin huddle-client -- --server-url ws://127.0.0.1:4010/ws \
//!     --credential "$TOKEN" --join 1
//! ```

use std::io::BufRead;

use clap::Parser;
use tokio::sync::mpsc;

use huddle_client::config::{CliArgs, ClientConfig};
use huddle_client::fallback::NullFallback;
use huddle_client::session::{self, SessionCommand, SessionEvent};
use huddle_proto::ids::RoomId;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to stderr; stdout belongs to the conversation.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(session_config) = config.session() else {
        eprintln!(
            "A server url and credential are required, e.g.\n\
             huddle-client --server-url ws://127.0.0.1:4010/ws --credential <token>"
        );
        std::process::exit(2);
    };

    let (cmd_tx, evt_rx) = match session::spawn_session(session_config, NullFallback).await {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("Could not reach the chat server: {e}");
            std::process::exit(1);
        }
    };

    let stdin_rx = spawn_stdin_reader();
    run_console(cmd_tx, evt_rx, stdin_rx).await;
}

/// Read stdin on a dedicated thread; the runtime must not block on it.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Main console loop: interleave session events with stdin lines.
async fn run_console(
    cmd_tx: mpsc::Sender<SessionCommand>,
    mut evt_rx: mpsc::Receiver<SessionEvent>,
    mut stdin_rx: mpsc::Receiver<String>,
) {
    let mut active_room: Option<RoomId> = None;

    loop {
        tokio::select! {
            maybe_event = evt_rx.recv() => {
                let Some(event) = maybe_event else {
                    println!("! session ended");
                    return;
                };
                print_event(&event, &mut active_room);
            }
            maybe_line = stdin_rx.recv() => {
                let Some(line) = maybe_line else {
                    let _ = cmd_tx.send(SessionCommand::Shutdown).await;
                    return;
                };
                if !handle_line(&cmd_tx, &mut active_room, line.trim()).await {
                    let _ = cmd_tx.send(SessionCommand::Shutdown).await;
                    return;
                }
            }
        }
    }
}

/// Interpret one stdin line. Returns `false` when the user quits.
async fn handle_line(
    cmd_tx: &mpsc::Sender<SessionCommand>,
    active_room: &mut Option<RoomId>,
    line: &str,
) -> bool {
    if line.is_empty() {
        return true;
    }

    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("quit"), _) => return false,
            (Some("join"), Some(id)) => match id.parse::<i64>() {
                Ok(id) => {
                    let room_id = RoomId::new(id);
                    *active_room = Some(room_id);
                    let _ = cmd_tx.send(SessionCommand::Join { room_id }).await;
                }
                Err(_) => println!("! room ids are numeric: /join 42"),
            },
            (Some("leave"), Some(id)) => match id.parse::<i64>() {
                Ok(id) => {
                    let room_id = RoomId::new(id);
                    if *active_room == Some(room_id) {
                        *active_room = None;
                    }
                    let _ = cmd_tx.send(SessionCommand::Leave { room_id }).await;
                }
                Err(_) => println!("! room ids are numeric: /leave 42"),
            },
            (Some("read"), Some(id)) => match id.parse::<i64>() {
                Ok(id) => {
                    let room_id = RoomId::new(id);
                    let _ = cmd_tx.send(SessionCommand::MarkRead { room_id }).await;
                }
                Err(_) => println!("! room ids are numeric: /read 42"),
            },
            _ => println!("! commands: /join <id>, /leave <id>, /read <id>, /quit"),
        }
        return true;
    }

    match *active_room {
        Some(room_id) => {
            let _ = cmd_tx
                .send(SessionCommand::Send {
                    room_id,
                    content: line.to_string(),
                })
                .await;
        }
        None => println!("! join a room first: /join <id>"),
    }
    true
}

/// Render one session event to stdout.
fn print_event(event: &SessionEvent, active_room: &mut Option<RoomId>) {
    match event {
        SessionEvent::Connected { user } => {
            println!("* connected as {} ({})", user.name, user.role);
        }
        SessionEvent::Disconnected => println!("* connection lost"),
        SessionEvent::Reconnecting {
            attempt,
            max_attempts,
        } => println!("* reconnecting (attempt {attempt}/{max_attempts})"),
        SessionEvent::ReconnectFailed => {
            println!("* could not reach the server again, giving up");
        }
        SessionEvent::Evicted { reason } => {
            println!("* disconnected by the server: {reason}");
        }
        SessionEvent::RoomJoined {
            room,
            participants,
            online_count,
        } => {
            if active_room.is_none() {
                *active_room = Some(room.id);
            }
            println!(
                "* joined {} (#{}) with {} participants, {} online",
                room.name,
                room.id,
                participants.len(),
                online_count
            );
        }
        SessionEvent::RoomRejoined {
            room_id,
            recovered,
            online_count,
        } => {
            println!("* back in #{room_id}, {recovered} missed messages, {online_count} online");
        }
        SessionEvent::RoomLeft { room_id } => {
            if *active_room == Some(*room_id) {
                *active_room = None;
            }
            println!("* left #{room_id}");
        }
        SessionEvent::MessageReceived { room_id, message } => {
            let sender = message
                .sender
                .as_ref()
                .map_or_else(|| message.sender_id.to_string(), |s| s.name.clone());
            println!(
                "[{}] #{room_id} {sender}: {}",
                format_timestamp_ms(message.created_at.as_millis()),
                message.content
            );
        }
        SessionEvent::MessageAcked { room_id, message } => {
            println!(
                "[{}] #{room_id} you: {}",
                format_timestamp_ms(message.created_at.as_millis()),
                message.content
            );
        }
        SessionEvent::SendFailed { room_id, reason } => {
            println!("! message to #{room_id} not delivered: {reason}");
        }
        SessionEvent::PeerJoined {
            room_id,
            user,
            online_count,
        } => println!("* {} joined #{room_id} ({online_count} online)", user.name),
        SessionEvent::PeerLeft {
            room_id,
            user_id,
            reason,
        } => println!("* user {user_id} left #{room_id} ({reason})"),
        SessionEvent::PeerTyping {
            room_id,
            user_id,
            is_typing,
        } => {
            if *is_typing {
                println!("* user {user_id} is typing in #{room_id}");
            }
        }
        SessionEvent::MessagesRead { room_id, user_id } => {
            println!("* user {user_id} read #{room_id}");
        }
        SessionEvent::ServerError { code, message } => {
            println!("! server error [{code}]: {message}");
        }
    }
}

/// Format an epoch-millisecond timestamp as local wall-clock time.
fn format_timestamp_ms(ms: u64) -> String {
    use chrono::{Local, TimeZone};
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M:%S").to_string(),
        _ => "??:??:??".to_string(),
    }
}
