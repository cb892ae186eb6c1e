//! Backlog accounting that feeds the I/O controller's share allocation.
//!
//! Each table installs a [`BacklogTracker`] whose strategy-specific impl
//! turns in-flight read/write progress into a scalar backlog estimate. The
//! shard-wide [`BacklogManager`] sums all live trackers. The subsystem is
//! self-disabling: a failing impl permanently parks its tracker on a
//! sentinel value so the controller keeps functioning.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::error;
use parking_lot::Mutex;

use crate::controller::{CompactionController, DISABLE_BACKLOG};
use crate::error::Error;
use crate::sstable::{SsTableHandle, SsTableId};

/// Progress of an sstable being produced by an in-flight compaction.
pub trait WriteProgress: Send + Sync {
    fn bytes_written(&self) -> u64;
}

/// Progress of an input sstable being consumed by an in-flight compaction.
pub trait ReadProgress: Send + Sync {
    fn bytes_read(&self) -> u64;
}

pub type OngoingWrites = HashMap<SsTableId, (SsTableHandle, Arc<dyn WriteProgress>)>;
pub type OngoingCompactions = HashMap<SsTableId, (SsTableHandle, Arc<dyn ReadProgress>)>;

/// Strategy-specific backlog computation.
pub trait BacklogTrackerImpl: Send + Sync {
    fn backlog(&self, writes: &OngoingWrites, compactions: &OngoingCompactions)
        -> Result<f64, Error>;

    /// Observe a set update so per-sstable contributions follow the files.
    fn replace_sstables(
        &self,
        old: Vec<SsTableHandle>,
        new: Vec<SsTableHandle>,
    ) -> Result<(), Error>;
}

struct TrackerInner {
    backlog_impl: Box<dyn BacklogTrackerImpl>,
    ongoing_writes: OngoingWrites,
    ongoing_compactions: OngoingCompactions,
    disabled: bool,
}

pub(crate) struct TrackerState {
    inner: Mutex<TrackerInner>,
}

impl TrackerState {
    fn backlog(&self) -> Result<f64, Error> {
        let guard = self.inner.lock();
        if guard.disabled {
            return Ok(DISABLE_BACKLOG);
        }
        guard
            .backlog_impl
            .backlog(&guard.ongoing_writes, &guard.ongoing_compactions)
    }
}

/// A table's backlog tracker. Owned by its user; registration with the
/// manager installs a weak back-link that drop clears, so neither side owns
/// the other.
pub struct BacklogTracker {
    state: Arc<TrackerState>,
    manager: Mutex<Option<Weak<BacklogManagerState>>>,
}

impl BacklogTracker {
    pub fn new(backlog_impl: Box<dyn BacklogTrackerImpl>) -> Self {
        Self {
            state: Arc::new(TrackerState {
                inner: Mutex::new(TrackerInner {
                    backlog_impl,
                    ongoing_writes: HashMap::new(),
                    ongoing_compactions: HashMap::new(),
                    disabled: false,
                }),
            }),
            manager: Mutex::new(None),
        }
    }

    pub fn backlog(&self) -> Result<f64, Error> {
        self.state.backlog()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.inner.lock().disabled
    }

    fn disable(&self) {
        self.state.inner.lock().disabled = true;
    }

    /// Route a set update through the tracker: revert charges for the files
    /// it owns, then let the impl adjust its totals. An impl failure
    /// permanently disables the tracker.
    pub fn replace_sstables(&self, old: &[SsTableHandle], new: &[SsTableHandle]) {
        let result = {
            let mut guard = self.state.inner.lock();
            if guard.disabled {
                return;
            }
            let filter_and_revert = |guard: &mut TrackerInner, ssts: &[SsTableHandle]| {
                let mut ret = Vec::new();
                for sst in ssts {
                    if sst.is_eligible_for_compaction() {
                        guard.ongoing_writes.remove(&sst.id());
                        guard.ongoing_compactions.remove(&sst.id());
                        ret.push(sst.clone());
                    }
                }
                ret
            };
            let old = filter_and_revert(&mut guard, old);
            let new = filter_and_revert(&mut guard, new);
            guard.backlog_impl.replace_sstables(old, new)
        };
        if let Err(e) = result {
            error!("disabling backlog tracker due to error [error={:?}]", e);
            self.disable();
        }
    }

    pub fn register_partially_written_sstable(
        &self,
        sst: SsTableHandle,
        progress: Arc<dyn WriteProgress>,
    ) {
        let mut guard = self.state.inner.lock();
        if guard.disabled {
            return;
        }
        guard.ongoing_writes.insert(sst.id(), (sst, progress));
    }

    pub fn register_compacting_sstable(&self, sst: SsTableHandle, progress: Arc<dyn ReadProgress>) {
        let mut guard = self.state.inner.lock();
        if guard.disabled {
            return;
        }
        guard.ongoing_compactions.insert(sst.id(), (sst, progress));
    }

    pub fn revert_charges(&self, sst: &SsTableHandle) {
        let mut guard = self.state.inner.lock();
        guard.ongoing_writes.remove(&sst.id());
        guard.ongoing_compactions.remove(&sst.id());
    }

    /// Migrate in-flight charges to another tracker, e.g. when the table's
    /// strategy changes mid-compaction. Writes always move; read charges
    /// move only when requested.
    pub fn transfer_ongoing_charges(&self, to: &BacklogTracker, move_read_charges: bool) {
        let (writes, compactions) = {
            let mut guard = self.state.inner.lock();
            (
                std::mem::take(&mut guard.ongoing_writes),
                std::mem::take(&mut guard.ongoing_compactions),
            )
        };
        for (_, (sst, progress)) in writes {
            to.register_partially_written_sstable(sst, progress);
        }
        if move_read_charges {
            for (_, (sst, progress)) in compactions {
                to.register_compacting_sstable(sst, progress);
            }
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }
}

impl Drop for BacklogTracker {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.get_mut().take().and_then(|w| w.upgrade()) {
            manager.trackers.lock().remove(&self.key());
        }
    }
}

pub(crate) struct BacklogManagerState {
    trackers: Mutex<HashMap<usize, Weak<TrackerState>>>,
}

/// Shard-wide aggregate of all registered trackers.
pub(crate) struct BacklogManager {
    state: Arc<BacklogManagerState>,
    controller: Arc<CompactionController>,
}

impl BacklogManager {
    pub(crate) fn new(controller: Arc<CompactionController>) -> Self {
        Self {
            state: Arc::new(BacklogManagerState {
                trackers: Mutex::new(HashMap::new()),
            }),
            controller,
        }
    }

    pub(crate) fn register_backlog_tracker(&self, tracker: &BacklogTracker) {
        tracker
            .manager
            .lock()
            .replace(Arc::downgrade(&self.state));
        self.state
            .trackers
            .lock()
            .insert(tracker.key(), Arc::downgrade(&tracker.state));
    }

    /// Sum of all tracker backlogs. The disable sentinel propagates through
    /// the sum; a tracker error degrades to a fixed high backlog so the
    /// controller still gets a usable value.
    pub(crate) fn backlog(&self) -> f64 {
        let trackers: Vec<Arc<TrackerState>> = {
            let guard = self.state.trackers.lock();
            guard.values().filter_map(|w| w.upgrade()).collect()
        };
        let mut backlog = 0.0;
        for tracker in trackers {
            match tracker.backlog() {
                Ok(b) => backlog += b,
                Err(_) => return self.controller.backlog_of_shares(1000.0),
            }
        }
        backlog
    }
}

/// Fixed backlog standing in for user-initiated jobs (major, rewrite),
/// sized so the controller hands them a predictable share of bandwidth.
pub struct UserInitiatedBacklogTracker {
    added_backlog: f64,
    available_memory: u64,
}

impl UserInitiatedBacklogTracker {
    pub fn new(added_backlog: f64, available_memory: u64) -> Self {
        Self {
            added_backlog,
            available_memory,
        }
    }
}

impl BacklogTrackerImpl for UserInitiatedBacklogTracker {
    fn backlog(
        &self,
        _writes: &OngoingWrites,
        _compactions: &OngoingCompactions,
    ) -> Result<f64, Error> {
        Ok(self.added_backlog * self.available_memory as f64)
    }

    fn replace_sstables(
        &self,
        _old: Vec<SsTableHandle>,
        _new: Vec<SsTableHandle>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::backlog_disabled;
    use crate::sstable::{SsTable, SsTableId};
    use crate::utils::IdGenerator;

    struct FixedBacklog(f64);

    impl BacklogTrackerImpl for FixedBacklog {
        fn backlog(
            &self,
            _w: &OngoingWrites,
            _c: &OngoingCompactions,
        ) -> Result<f64, Error> {
            Ok(self.0)
        }

        fn replace_sstables(
            &self,
            _old: Vec<SsTableHandle>,
            _new: Vec<SsTableHandle>,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    struct FailingImpl;

    impl BacklogTrackerImpl for FailingImpl {
        fn backlog(
            &self,
            _w: &OngoingWrites,
            _c: &OngoingCompactions,
        ) -> Result<f64, Error> {
            Err(Error::Unexpected {
                msg: "broken".to_string(),
            })
        }

        fn replace_sstables(
            &self,
            _old: Vec<SsTableHandle>,
            _new: Vec<SsTableHandle>,
        ) -> Result<(), Error> {
            Err(Error::Unexpected {
                msg: "broken".to_string(),
            })
        }
    }

    fn manager() -> BacklogManager {
        let controller = Arc::new(CompactionController::new(0.0, Box::new(|| 0.0)));
        BacklogManager::new(controller)
    }

    fn sst() -> SsTableHandle {
        let mut rng = rand::rng();
        Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), 1))
    }

    #[test]
    fn test_manager_sums_trackers() {
        let manager = manager();
        let t1 = BacklogTracker::new(Box::new(FixedBacklog(10.0)));
        let t2 = BacklogTracker::new(Box::new(FixedBacklog(32.0)));
        manager.register_backlog_tracker(&t1);
        manager.register_backlog_tracker(&t2);
        assert_eq!(manager.backlog(), 42.0);
        drop(t1);
        assert_eq!(manager.backlog(), 32.0);
    }

    #[test]
    fn test_disabled_tracker_reports_sentinel() {
        let manager = manager();
        let t1 = BacklogTracker::new(Box::new(FixedBacklog(10.0)));
        let t2 = BacklogTracker::new(Box::new(FailingImpl));
        manager.register_backlog_tracker(&t1);
        manager.register_backlog_tracker(&t2);

        // a failing replace permanently disables the tracker
        t2.replace_sstables(&[sst()], &[]);
        assert!(t2.is_disabled());
        assert_eq!(t2.backlog().unwrap(), DISABLE_BACKLOG);
        assert!(backlog_disabled(manager.backlog()));
    }

    #[test]
    fn test_manager_falls_back_on_tracker_error() {
        let manager = manager();
        let t = BacklogTracker::new(Box::new(FailingImpl));
        manager.register_backlog_tracker(&t);
        assert_eq!(manager.backlog(), 30.0);
    }

    #[test]
    fn test_transfer_ongoing_charges() {
        struct CountingImpl;
        impl BacklogTrackerImpl for CountingImpl {
            fn backlog(
                &self,
                w: &OngoingWrites,
                c: &OngoingCompactions,
            ) -> Result<f64, Error> {
                Ok((w.len() + c.len()) as f64)
            }
            fn replace_sstables(
                &self,
                _old: Vec<SsTableHandle>,
                _new: Vec<SsTableHandle>,
            ) -> Result<(), Error> {
                Ok(())
            }
        }
        struct NoProgress;
        impl WriteProgress for NoProgress {
            fn bytes_written(&self) -> u64 {
                0
            }
        }
        impl ReadProgress for NoProgress {
            fn bytes_read(&self) -> u64 {
                0
            }
        }

        let from = BacklogTracker::new(Box::new(CountingImpl));
        let to = BacklogTracker::new(Box::new(CountingImpl));
        from.register_partially_written_sstable(sst(), Arc::new(NoProgress));
        from.register_compacting_sstable(sst(), Arc::new(NoProgress));
        assert_eq!(from.backlog().unwrap(), 2.0);

        from.transfer_ongoing_charges(&to, false);
        assert_eq!(from.backlog().unwrap(), 0.0);
        // only the write charge moved
        assert_eq!(to.backlog().unwrap(), 1.0);
    }

    #[test]
    fn test_user_initiated_backlog() {
        let t = UserInitiatedBacklogTracker::new(1.5, 1024);
        let (w, c) = (OngoingWrites::new(), OngoingCompactions::new());
        assert_eq!(t.backlog(&w, &c).unwrap(), 1536.0);
    }
}
