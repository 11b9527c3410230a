//! Service configuration parsed from environment variables.
//!
//! Every knob has a default, so an empty environment yields a working
//! single-node server backed by the in-memory presence store.

use std::time::Duration;

use crate::services::room::RoomPolicy;
use crate::state::DEFAULT_ROOM_CAPACITY;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 120;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CAS_RETRIES: u32 = 8;
pub const DEFAULT_STORE_RETRIES: u32 = 3;
pub const DEFAULT_STORE_RETRY_BASE_MS: u64 = 20;
pub const DEFAULT_CODE_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    pub port: u16,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub room_capacity: u32,
    pub stale_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub cas_retries: u32,
    pub store_retries: u32,
    pub store_retry_base_ms: u64,
    pub code_attempts: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ArenaConfig {
    /// Build config from the process environment.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DATABASE_URL`: Postgres presence store; in-memory when absent
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `ROOM_CAPACITY`: default 5
    /// - `STALE_THRESHOLD_SECS`: default 120
    /// - `HEARTBEAT_INTERVAL_SECS`: default 30, clamped below the threshold
    /// - `SWEEP_INTERVAL_SECS`: default 30
    /// - `CAS_RETRIES`, `STORE_RETRIES`, `STORE_RETRY_BASE_MS`, `CODE_ATTEMPTS`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let stale_secs = parse("STALE_THRESHOLD_SECS")
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_STALE_THRESHOLD_SECS);
        let stale_threshold = Duration::from_secs(stale_secs);
        let heartbeat_interval = clamp_heartbeat(
            Duration::from_secs(parse("HEARTBEAT_INTERVAL_SECS").unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS)),
            stale_threshold,
        );

        Self {
            port: lookup("PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parse_u32(&parse, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            room_capacity: parse_u32(&parse, "ROOM_CAPACITY", DEFAULT_ROOM_CAPACITY).max(1),
            stale_threshold,
            heartbeat_interval,
            sweep_interval: Duration::from_secs(
                parse("SWEEP_INTERVAL_SECS")
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            cas_retries: parse_u32(&parse, "CAS_RETRIES", DEFAULT_CAS_RETRIES).max(1),
            store_retries: parse_u32(&parse, "STORE_RETRIES", DEFAULT_STORE_RETRIES).max(1),
            store_retry_base_ms: parse("STORE_RETRY_BASE_MS").unwrap_or(DEFAULT_STORE_RETRY_BASE_MS),
            code_attempts: parse_u32(&parse, "CODE_ATTEMPTS", DEFAULT_CODE_ATTEMPTS).max(1),
        }
    }

    #[must_use]
    pub fn room_policy(&self) -> RoomPolicy {
        RoomPolicy {
            capacity: self.room_capacity,
            cas_retries: self.cas_retries,
            store_retries: self.store_retries,
            store_retry_base: Duration::from_millis(self.store_retry_base_ms),
            code_attempts: self.code_attempts,
        }
    }

    /// Staleness threshold in milliseconds, as stored member timestamps use.
    #[must_use]
    pub fn stale_threshold_ms(&self) -> i64 {
        i64::try_from(self.stale_threshold.as_millis()).unwrap_or(i64::MAX)
    }
}

fn parse_u32(parse: &impl Fn(&str) -> Option<u64>, key: &str, default: u32) -> u32 {
    parse(key)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

/// Heartbeats must land well inside the staleness window; keep at most a
/// quarter of it when misconfigured.
fn clamp_heartbeat(interval: Duration, stale_threshold: Duration) -> Duration {
    if interval.is_zero() || interval >= stale_threshold {
        stale_threshold / 4
    } else {
        interval
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
