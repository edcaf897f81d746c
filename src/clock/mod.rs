use std::time::{SystemTime, UNIX_EPOCH};

#[cfg_attr(test, mockall::automock)]
pub trait LocalClock {
    /// Host wall-clock time in Unix seconds (fractional).
    fn now(&self) -> f64;
}

/// The host's realtime clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now(&self) -> f64 {
        unix_seconds(SystemTime::now())
    }
}

/// Convert a SystemTime to fractional Unix seconds. Times before the epoch come out negative.
pub fn unix_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}
