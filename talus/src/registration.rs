use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::compaction::CompactionDescriptor;
use crate::sstable::{SsTableHandle, SsTableId};

/// Log base for deriving a compaction job's weight from its input size.
/// With base 4, a tiny job admitted next to a long-running one finishes well
/// within the big job's lifetime, so they are allowed to run in parallel.
const WEIGHT_LOG_BASE: f64 = 4.0;

/// Fixed tax added to the size before taking the log, so that all jobs
/// smaller than the tax (1 MiB) land in the same weight class and are
/// serialized.
const WEIGHT_FIXED_SIZE_TAX: u64 = 1024 * 1024;

pub(crate) fn calculate_weight(total_size: u64) -> i64 {
    (((total_size + WEIGHT_FIXED_SIZE_TAX) as f64).ln() / WEIGHT_LOG_BASE.ln()) as i64
}

/// Weight of a descriptor. Empty or fully-expired-only descriptors get
/// weight 0: they are fast and efficient and should never wait behind, or
/// hold back, real merges.
pub(crate) fn descriptor_weight(descriptor: &CompactionDescriptor) -> i64 {
    if descriptor.sstables.is_empty() || descriptor.has_only_fully_expired {
        return 0;
    }
    calculate_weight(descriptor.sstables_size())
}

/// Shard-wide set of sstables currently owned by some task. Candidates are
/// filtered against it so no file is ever compacted by two jobs at once.
pub(crate) struct CompactingRegistry {
    compacting: Mutex<HashSet<SsTableId>>,
}

impl CompactingRegistry {
    pub(crate) fn new() -> Self {
        Self {
            compacting: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn contains(&self, id: SsTableId) -> bool {
        self.compacting.lock().contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.compacting.lock().len()
    }

    fn register<'a>(&self, ssts: impl IntoIterator<Item = &'a SsTableHandle>) {
        let mut guard = self.compacting.lock();
        for sst in ssts {
            guard.insert(sst.id());
        }
    }

    fn deregister<'a>(&self, ssts: impl IntoIterator<Item = &'a SsTableHandle>) {
        let mut guard = self.compacting.lock();
        for sst in ssts {
            guard.remove(&sst.id());
        }
    }
}

/// Scoped ownership of a descriptor's input files in the registry. Files can
/// be released early as the job exhausts them; whatever remains is
/// deregistered exactly once when the registration drops.
pub(crate) struct CompactingRegistration {
    registry: Arc<CompactingRegistry>,
    compacting: Mutex<HashSet<SsTableHandle>>,
}

impl CompactingRegistration {
    pub(crate) fn new(registry: Arc<CompactingRegistry>) -> Self {
        Self {
            registry,
            compacting: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn with_sstables(
        registry: Arc<CompactingRegistry>,
        ssts: &[SsTableHandle],
    ) -> Self {
        let registration = Self::new(registry);
        registration.register(ssts);
        registration
    }

    pub(crate) fn register(&self, ssts: &[SsTableHandle]) {
        self.compacting.lock().extend(ssts.iter().cloned());
        self.registry.register(ssts);
    }

    /// Release a subset ahead of completion, e.g. exhausted inputs whose
    /// disk space should be reclaimable immediately. Releasing files not
    /// held by this registration is a no-op for the remaining set.
    pub(crate) fn release(&self, ssts: &[SsTableHandle]) {
        self.registry.deregister(ssts);
        let mut guard = self.compacting.lock();
        for sst in ssts {
            guard.remove(sst);
        }
    }
}

impl Drop for CompactingRegistration {
    fn drop(&mut self) {
        let remaining = self.compacting.get_mut();
        self.registry.deregister(remaining.iter());
    }
}

/// Multiset of the weight classes of currently executing compactions.
/// Admission serializes same-weight jobs; distinct classes run in parallel.
pub(crate) struct WeightTracker {
    weights: Mutex<HashMap<i64, u32>>,
}

impl WeightTracker {
    pub(crate) fn new() -> Self {
        Self {
            weights: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn contains(&self, weight: i64) -> bool {
        self.weights.lock().get(&weight).is_some_and(|c| *c > 0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.weights.lock().values().all(|c| *c == 0)
    }

    pub(crate) fn clear(&self) {
        self.weights.lock().clear();
    }

    fn register(&self, weight: i64) {
        *self.weights.lock().entry(weight).or_insert(0) += 1;
    }

    fn deregister(&self, weight: i64) {
        let mut guard = self.weights.lock();
        if let Some(count) = guard.get_mut(&weight) {
            *count -= 1;
            if *count == 0 {
                guard.remove(&weight);
            }
        }
    }
}

/// Holds one weight class for the duration of a regular compaction attempt.
/// Deregistration signals the postponed-reevaluation fiber, since a freed
/// class may admit a previously rejected job.
pub(crate) struct WeightRegistration {
    tracker: Arc<WeightTracker>,
    reevaluate: Arc<Notify>,
    weight: i64,
    held: bool,
}

impl WeightRegistration {
    pub(crate) fn new(tracker: Arc<WeightTracker>, reevaluate: Arc<Notify>, weight: i64) -> Self {
        tracker.register(weight);
        Self {
            tracker,
            reevaluate,
            weight,
            held: true,
        }
    }

    /// Release the weight ahead of scope exit, e.g. before a slow history
    /// update, so a same-class job doesn't wait on unrelated bookkeeping.
    pub(crate) fn deregister(&mut self) {
        if self.held {
            self.held = false;
            self.tracker.deregister(self.weight);
            self.reevaluate.notify_one();
        }
    }
}

impl Drop for WeightRegistration {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionOptions;
    use crate::sstable::SsTable;
    use crate::utils::IdGenerator;

    fn sst(size: u64) -> SsTableHandle {
        let mut rng = rand::rng();
        Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), size))
    }

    #[test]
    fn test_weight_buckets() {
        // everything under the 1 MiB tax shares one class
        assert_eq!(calculate_weight(0), calculate_weight(1024));
        // 10 GiB lands well above the 1 MiB class
        let small = calculate_weight(1024);
        let large = calculate_weight(10 * 1024 * 1024 * 1024);
        assert!(large > small);
        assert_eq!(large, 16);
    }

    #[test]
    fn test_descriptor_weight_zero_cases() {
        let empty = CompactionDescriptor::new(vec![], CompactionOptions::Regular);
        assert_eq!(descriptor_weight(&empty), 0);

        let mut rng = rand::rng();
        let expired = Arc::new(
            SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), 1 << 30)
                .with_fully_expired(true),
        );
        let desc = CompactionDescriptor::new(vec![expired], CompactionOptions::Regular);
        assert_eq!(descriptor_weight(&desc), 0);
    }

    #[test]
    fn test_registration_deregisters_on_drop() {
        let registry = Arc::new(CompactingRegistry::new());
        let a = sst(1);
        let b = sst(1);
        {
            let registration = CompactingRegistration::with_sstables(
                registry.clone(),
                &[a.clone(), b.clone()],
            );
            assert!(registry.contains(a.id()));
            assert!(registry.contains(b.id()));
            registration.release(&[a.clone()]);
            assert!(!registry.contains(a.id()));
            assert!(registry.contains(b.id()));
            // releasing again is a no-op
            registration.release(&[a.clone()]);
            assert!(registry.contains(b.id()));
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_weight_tracker_multiset() {
        let tracker = Arc::new(WeightTracker::new());
        let reevaluate = Arc::new(Notify::new());
        let mut first = WeightRegistration::new(tracker.clone(), reevaluate.clone(), 0);
        let second = WeightRegistration::new(tracker.clone(), reevaluate.clone(), 0);
        assert!(tracker.contains(0));
        first.deregister();
        // the other weight-0 registration is still live
        assert!(tracker.contains(0));
        drop(second);
        assert!(!tracker.contains(0));
        assert!(tracker.is_empty());
    }
}
