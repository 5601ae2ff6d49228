//! `Rundown` server library.
//!
//! Owns the authoritative agenda and timer state of every service and pushes
//! each committed change to the clients subscribed to that service. Exposed
//! as a library for embedding and tests.

pub mod agenda;
pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod locks;
pub mod store;
pub mod timer;
