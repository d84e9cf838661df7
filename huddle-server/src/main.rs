//! Huddle support-chat server.
//!
//! An axum WebSocket gateway that authenticates support-chat clients,
//! tracks who is present in which room and fans chat events out to
//! everyone concerned.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:4010 with demo seed data
//! cargo run --bin huddle-server
//!
//! # Run on custom address with a fixed secret
//! cargo run --bin huddle-server -- --bind 127.0.0.1:8080 --secret dev-secret
//!
//! # Or via environment variables
//! HUDDLE_ADDR=127.0.0.1:8080 HUDDLE_SECRET=dev-secret cargo run --bin huddle-server
//!
//! # Mint a dev credential for seeded user 1
//! cargo run --bin huddle-server -- --secret dev-secret token --user 1
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use huddle_proto::ids::{RoomId, UserId};
use huddle_proto::room::{RoomKind, RoomSummary};
use huddle_proto::user::{Role, UserProfile};
use huddle_server::auth::Authenticator;
use huddle_server::config::{ServerCliArgs, ServerCommand, ServerConfig};
use huddle_server::gateway::{self, ChatState};
use huddle_server::services::{
    InMemoryMessages, InMemoryRooms, InMemoryUsers, RoomRecord, Services, UserRecord,
};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Some(ServerCommand::Token { user, ttl_secs }) = cli.command {
        mint_token(&config, user, ttl_secs);
        return;
    }

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.generated_secret {
        tracing::warn!(
            "no secret configured; credentials signed against this ephemeral secret die with the process"
        );
    }
    tracing::info!(addr = %config.bind_addr, "starting huddle server");

    let authenticator = Authenticator::new(config.secret.clone());
    let services = seeded_services(&config);
    let state = Arc::new(ChatState::with_settings(
        authenticator,
        services,
        config.settings.clone(),
    ));

    match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "huddle server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}

/// Prints a signed credential for `user` to stdout and exits.
fn mint_token(config: &ServerConfig, user: i64, ttl_secs: u64) {
    if config.generated_secret {
        eprintln!(
            "warning: no secret configured; this credential only verifies against a server \
             started with the same --secret"
        );
    }
    let authenticator = Authenticator::new(config.secret.clone());
    match authenticator.sign(UserId::new(user), Duration::from_secs(ttl_secs)) {
        Ok(token) => println!("{token}"),
        Err(e) => {
            eprintln!("Error minting credential: {e}");
            std::process::exit(1);
        }
    }
}

/// Builds the in-memory services from the `[seed]` section, or from a
/// small demo data set when the config names none.
fn seeded_services(
    config: &ServerConfig,
) -> Services<InMemoryRooms, InMemoryMessages, InMemoryUsers> {
    let (users, rooms) = if config.seed_users.is_empty() && config.seed_rooms.is_empty() {
        tracing::info!("no seed data configured; loading the demo data set");
        demo_seed()
    } else {
        let users = config
            .seed_users
            .iter()
            .map(|seed| UserRecord {
                profile: UserProfile {
                    id: UserId::new(seed.id),
                    name: seed.name.clone(),
                    avatar: seed.avatar.clone(),
                    role: seed.role.unwrap_or(Role::Member),
                },
                active: seed.active.unwrap_or(true),
            })
            .collect();
        let rooms = config
            .seed_rooms
            .iter()
            .map(|seed| RoomRecord {
                summary: RoomSummary {
                    id: RoomId::new(seed.id),
                    name: seed.name.clone(),
                    kind: seed.kind.unwrap_or(RoomKind::Group),
                    active: seed.active.unwrap_or(true),
                },
                participant_ids: seed.participants.iter().copied().map(UserId::new).collect(),
                last_message_at: None,
            })
            .collect();
        (users, rooms)
    };

    tracing::info!(
        users = users.len(),
        rooms = rooms.len(),
        "seeded in-memory services"
    );
    Services {
        rooms: InMemoryRooms::with_rooms(rooms),
        store: InMemoryMessages::new(),
        users: InMemoryUsers::with_users(users),
    }
}

/// Two customers, one support agent and a shared support room.
fn demo_seed() -> (Vec<UserRecord>, Vec<RoomRecord>) {
    let profile = |id: i64, name: &str, role: Role| UserProfile {
        id: UserId::new(id),
        name: name.to_string(),
        avatar: None,
        role,
    };
    let users = vec![
        UserRecord {
            profile: profile(1, "alice", Role::Member),
            active: true,
        },
        UserRecord {
            profile: profile(2, "bob", Role::Member),
            active: true,
        },
        UserRecord {
            profile: profile(3, "sam", Role::Support),
            active: true,
        },
    ];
    let rooms = vec![RoomRecord {
        summary: RoomSummary {
            id: RoomId::new(1),
            name: "Support".to_string(),
            kind: RoomKind::Group,
            active: true,
        },
        participant_ids: vec![UserId::new(1), UserId::new(2), UserId::new(3)],
        last_message_at: None,
    }];
    (users, rooms)
}
