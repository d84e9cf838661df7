//! Shared protocol definitions for the huddle chat wire format.

pub mod codec;
pub mod event;
pub mod ids;
pub mod message;
pub mod room;
pub mod user;
