//! Study Arena room presence and capacity management.
//!
//! ARCHITECTURE
//! ============
//! Rooms live as versioned documents in a shared presence store. The room
//! service mutates them with optimistic compare-and-swap transactions, the
//! presence hub fans committed changes out as full member snapshots, and
//! each connected client runs a session controller that joins, heartbeats,
//! and leaves. A background sweeper prunes members whose heartbeats
//! stopped.

pub mod config;
pub mod db;
pub mod frame;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
