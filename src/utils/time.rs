//! Wall-clock helpers for values that travel on the wire.
//!
//! Session timers use `tokio::time::Instant`; only ping timestamps need an
//! absolute clock both peers can read.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Half the round trip from an echoed ping timestamp to `now_ms`, never negative.
pub fn latency_from_echo(echoed_ms: i64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(echoed_ms).max(0) / 2
}
