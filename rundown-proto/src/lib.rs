//! Shared domain types and wire protocol for `Rundown`.

pub mod agenda;
pub mod auth;
pub mod codec;
pub mod sync;
pub mod timer;
