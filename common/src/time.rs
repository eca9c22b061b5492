// Wall-clock helpers.
//
// Discovery packets carry an absolute expiration in unix seconds, so the
// protocol needs the system clock rather than a monotonic one. Everything that
// measures elapsed time locally (pending pings, handshake timeouts) uses
// `std::time::Instant` instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    // A clock set before 1970 is treated as the epoch itself
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

/// Whether an absolute expiration (unix seconds) lies in the past.
pub fn is_expired(expiration: TimestampSeconds) -> bool {
    expiration < get_current_time_in_seconds()
}
