//! Huddle support-chat server library.
//!
//! Exposes the chat gateway for use in tests and embedding. The server
//! accepts WebSocket connections, authenticates them against signed
//! credentials, tracks room presence and fans chat events out to every
//! connection concerned.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod presence;
pub mod registry;
pub mod services;
pub mod supervisor;
pub mod typing;
