//! Millisecond Wall Clock
//!
//! Timestamps used by write-rate shaping, scheduled jobs and the manager's
//! once-per-second timeout sweep.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 reads as zero rather than failing; every caller
/// only ever compares differences between two readings.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed since `earlier`, saturating at zero when the clock
/// stepped backwards.
pub fn elapsed_since(earlier: u64) -> u64 {
    now_millis().saturating_sub(earlier)
}
