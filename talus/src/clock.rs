use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Physical clock used for retry backoff bookkeeping, compaction history
/// timestamps and wait diagnostics. Swappable so tests can use a fixed or
/// stepped clock.
pub trait SystemClock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct DefaultSystemClock {
    last_tick: AtomicI64,
}

impl Default for DefaultSystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultSystemClock {
    pub fn new() -> Self {
        Self {
            last_tick: AtomicI64::new(i64::MIN),
        }
    }
}

impl SystemClock for DefaultSystemClock {
    fn now(&self) -> SystemTime {
        // SystemTime is not guaranteed to be monotonic; enforce it here
        let tick = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        self.last_tick.fetch_max(tick, Ordering::SeqCst);
        let millis = self.last_tick.load(Ordering::SeqCst);
        if millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(millis as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_clock_is_monotonic() {
        let clock = DefaultSystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
