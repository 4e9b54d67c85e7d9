//! Functions to work with time

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Return number of seconds that have elapsed since Unix epoch.
pub fn unix_time(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since_the_epoch| since_the_epoch.as_secs())
        .unwrap_or(0)
}

/// Current instant. Follows tokio's clock so tests can pause and advance it.
pub fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Time elapsed since `instant` according to `clock_now`.
pub fn clock_elapsed(instant: Instant) -> Duration {
    clock_now().saturating_duration_since(instant)
}
