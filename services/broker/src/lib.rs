//! vmlease broker
//!
//! Hands each connected user exactly one cloud machine, creating it on first
//! request, reusing it afterwards, and reclaiming it once the user goes idle
//! or disconnects.
//!
//! - [`manager`]: per-user resource records, single-flight creation, release
//! - [`connection`]: admission and the per-connection state machine
//! - [`reaper`]: idle eviction, snapshots, restart cleanup
//! - [`backend`]: provisioning backends (mock and HTTP)
//! - [`persistence`]: snapshot storage

pub mod api;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod manager;
pub mod persistence;
pub mod reaper;
pub mod state;
