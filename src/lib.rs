//! Snapwire Server Library
//!
//! An authoritative fixed-tick game server core: client connection state
//! machine, snapshot identifier pool, delta-compressed snapshot delivery,
//! map download and a remote console.
//!
//! # Features
//!
//! - `dnsbl` - DNS blocklist lookups through the system resolver (enabled by default)

pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod server;
pub mod snapshot;
