//! Validity-window checks and time encoding shared by private and public certificates.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::VALIDITY_BOUND_TOLERANCE;

/// Expired once `now >= not_after (+ tolerance for public certificates)`.
pub fn is_expired(now: SystemTime, not_after: SystemTime, use_public_tolerance: bool) -> bool {
    let limit = if use_public_tolerance {
        not_after + VALIDITY_BOUND_TOLERANCE
    } else {
        not_after
    };
    now >= limit
}

pub fn is_within_validity_period(
    now: SystemTime,
    not_before: SystemTime,
    not_after: SystemTime,
    use_public_tolerance: bool,
) -> bool {
    let start = if use_public_tolerance {
        not_before
            .checked_sub(VALIDITY_BOUND_TOLERANCE)
            .unwrap_or(UNIX_EPOCH)
    } else {
        not_before
    };
    now >= start && !is_expired(now, not_after, use_public_tolerance)
}

/// Signed nanoseconds since the unix epoch, used by persisted records.
pub fn to_unix_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

pub fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}
