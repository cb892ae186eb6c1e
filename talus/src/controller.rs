use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;

use crate::error::Error;

/// Control points mapping normalized backlog to I/O scheduler shares. Kept
/// deliberately coarse: the exact curve belongs to the embedding engine's
/// I/O scheduler, this crate only needs the mapping to be invertible.
const CONTROL_POINTS: [(f64, f64); 3] = [(0.0, 50.0), (1.5, 200.0), (30.0, 1000.0)];

/// Backlog value used when `backlog / available_memory` exceeds the highest
/// control point, i.e. the controller should emit maximum shares.
pub const NORMALIZATION_FACTOR: f64 = 30.0;

/// Sentinel reported by trackers whose strategy has no backlog
/// implementation, or which were disabled after a failure.
pub const DISABLE_BACKLOG: f64 = f64::INFINITY;

pub fn backlog_disabled(backlog: f64) -> bool {
    !backlog.is_finite()
}

/// Per-group bandwidth throttle. Implemented by the engine's I/O scheduler;
/// the manager only pushes new caps into it.
#[async_trait]
pub trait IoGroup: Send + Sync {
    async fn update_bandwidth(&self, bps: u64) -> Result<(), Error>;
}

/// I/O group that accepts any cap and never throttles. Default for tests
/// and embeddings without an I/O scheduler.
pub struct UnthrottledIoGroup;

#[async_trait]
impl IoGroup for UnthrottledIoGroup {
    async fn update_bandwidth(&self, _bps: u64) -> Result<(), Error> {
        Ok(())
    }
}

/// Execution group a task family runs under: a label for logging plus the
/// I/O handle whose bandwidth the manager may reconfigure.
#[derive(Clone)]
pub struct SchedulingGroup {
    pub name: &'static str,
    pub io: Arc<dyn IoGroup>,
}

impl SchedulingGroup {
    pub fn new(name: &'static str, io: Arc<dyn IoGroup>) -> Self {
        Self { name, io }
    }

    pub fn unthrottled(name: &'static str) -> Self {
        Self::new(name, Arc::new(UnthrottledIoGroup))
    }
}

/// Converts the manager's aggregate backlog into I/O scheduler shares. The
/// backlog source is installed at construction (a closure over the manager)
/// and sampled on demand; a non-zero static-shares setting bypasses the
/// feedback loop entirely.
pub struct CompactionController {
    static_shares: Mutex<f64>,
    backlog_fn: Box<dyn Fn() -> f64 + Send + Sync>,
    shutdown: AtomicBool,
}

impl CompactionController {
    pub(crate) fn new(static_shares: f64, backlog_fn: Box<dyn Fn() -> f64 + Send + Sync>) -> Self {
        Self {
            static_shares: Mutex::new(static_shares),
            backlog_fn,
            shutdown: AtomicBool::new(false),
        }
    }

    /// The normalized backlog at which the controller would grant `shares`.
    /// Inverse of the share curve; used to synthesize backlog for
    /// user-initiated jobs so they get a predictable slice of bandwidth.
    pub fn backlog_of_shares(&self, shares: f64) -> f64 {
        let (first_backlog, first_shares) = CONTROL_POINTS[0];
        if shares <= first_shares {
            return first_backlog;
        }
        for window in CONTROL_POINTS.windows(2) {
            let (b0, s0) = window[0];
            let (b1, s1) = window[1];
            if shares <= s1 {
                return b0 + (b1 - b0) * (shares - s0) / (s1 - s0);
            }
        }
        CONTROL_POINTS[CONTROL_POINTS.len() - 1].0
    }

    /// Shares the controller would emit right now.
    pub fn current_shares(&self) -> f64 {
        let static_shares = *self.static_shares.lock();
        if static_shares > 0.0 {
            return static_shares;
        }
        let backlog = (self.backlog_fn)();
        let backlog = if backlog_disabled(backlog) {
            NORMALIZATION_FACTOR
        } else {
            backlog
        };
        for window in CONTROL_POINTS.windows(2) {
            let (b0, s0) = window[0];
            let (b1, s1) = window[1];
            if backlog <= b1 {
                return s0 + (s1 - s0) * (backlog - b0) / (b1 - b0);
            }
        }
        CONTROL_POINTS[CONTROL_POINTS.len() - 1].1
    }

    pub async fn update_static_shares(&self, shares: f64) -> Result<(), Error> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        info!("updating static shares to {}", shares);
        *self.static_shares.lock() = shares;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(backlog: f64) -> CompactionController {
        CompactionController::new(0.0, Box::new(move || backlog))
    }

    #[test]
    fn test_backlog_of_shares_is_monotonic() {
        let c = controller(0.0);
        let mut last = -1.0;
        for shares in [0.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0] {
            let backlog = c.backlog_of_shares(shares);
            assert!(backlog >= last, "shares={} backlog={}", shares, backlog);
            last = backlog;
        }
        assert_eq!(c.backlog_of_shares(1000.0), NORMALIZATION_FACTOR);
    }

    #[test]
    fn test_disabled_backlog_yields_max_shares() {
        let c = controller(DISABLE_BACKLOG);
        assert_eq!(c.current_shares(), 1000.0);
    }

    #[test]
    fn test_static_shares_bypass_feedback() {
        let c = CompactionController::new(321.0, Box::new(|| 0.0));
        assert_eq!(c.current_shares(), 321.0);
    }

    #[tokio::test]
    async fn test_update_static_shares_after_shutdown_fails() {
        let c = controller(0.0);
        c.update_static_shares(10.0).await.unwrap();
        c.shutdown().await;
        assert!(c.update_static_shares(20.0).await.is_err());
    }
}
