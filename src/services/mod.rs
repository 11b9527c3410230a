//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room rules and store access so route handlers can
//! stay focused on protocol translation and identity plumbing.

pub mod presence;
pub mod room;
pub mod session;
pub mod sweeper;
