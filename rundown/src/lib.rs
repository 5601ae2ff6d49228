//! `Rundown` client library.
//!
//! - [`sync`]: WebSocket client for the synchronization channel.
//! - [`clock`]: local playback clock that advances the display between
//!   authoritative snapshots.
//! - [`session`]: a reconnecting, ticking view of one service's timer.
//! - [`config`]: layered client configuration and CLI arguments.

pub mod clock;
pub mod config;
pub mod session;
pub mod sync;
