//! Huddle client library: chat session management for the console client.

pub mod config;
pub mod fallback;
pub mod session;
pub mod state;
