//! Real-time layer for conversations: authenticated WebSocket connections,
//! user presence, conversation rooms, message relay and typing indicators,
//! plus the weekly inactive-user notification job.

pub mod auth;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod inactivity;
pub mod protocol;
pub mod server;
pub mod state;

pub type ConnId = String;
pub type UserId = String;
/// Rooms are keyed by conversation id.
pub type RoomId = String;

pub use auth::Authenticator;
pub use config::Config;
pub use dispatch::{Realtime, Session};
pub use server::AppContext;
