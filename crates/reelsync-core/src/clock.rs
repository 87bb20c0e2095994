//! # Wall Clock
//!
//! Every timestamp in ReelSync is Unix epoch milliseconds (`i64`).
//! Clocks are NOT assumed synchronized between devices.

use chrono::Utc;

/// Expected worst-case clock skew between devices on the same LAN.
///
/// Advisory only: the last-writer-wins comparison does not consult it.
pub const CLOCK_SKEW_TOLERANCE_MS: i64 = 10_000;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Returns the current wall-clock time in Unix milliseconds.
#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
