//! Task flavors. Each implements [`TaskRun`] over the shared [`Task`] base;
//! the manager decides which flavor to attach when it performs a task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::backlog::{BacklogTracker, UserInitiatedBacklogTracker};
use crate::compaction::{
    CompactionCompletionDesc, CompactionData, CompactionDescriptor, CompactionOptions,
    QuarantineMode, ScrubMode, ScrubOptions,
};
use crate::error::Error;
use crate::manager::ManagerInner;
use crate::registration::{descriptor_weight, CompactingRegistration, WeightRegistration};
use crate::sstable::SsTableHandle;
use crate::strategy::ReshapeMode;
use crate::task::{should_update_history, RetryOutcome, Task, TaskState};

/// Flavor-specific body of a task. `do_run` may loop over rounds; the
/// shared base handles state accounting, retries and completion signaling.
#[async_trait]
pub(crate) trait TaskRun: Send + Sync {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error>;
}

/// Strategy-driven background compaction. Loops until the strategy has
/// nothing left, admission postpones it, or the table goes away.
pub(crate) struct RegularCompactionTask;

#[async_trait]
impl TaskRun for RegularCompactionTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        loop {
            if !task.can_proceed() {
                return Ok(());
            }
            task.switch_state(TaskState::Pending);
            // hold the table's read lock so major can't run setup in parallel
            let _lock = task
                .compaction_state()
                .lock
                .clone()
                .read_owned()
                .await;
            if !task.can_proceed() {
                return Ok(());
            }

            let t = task.table().clone();
            let strategy = t.get_compaction_strategy();
            let descriptor = strategy.get_sstables_for_compaction(
                &t,
                mgr.get_strategy_control().as_ref(),
                mgr.get_candidates(&t),
            );
            let weight = descriptor_weight(&descriptor);

            if descriptor.is_empty()
                || !task.can_proceed()
                || t.is_auto_compaction_disabled_by_user()
            {
                debug!(
                    "{}: sstables={} can_proceed={} auto_compaction_disabled={}",
                    task.describe(),
                    descriptor.sstables.len(),
                    task.can_proceed(),
                    t.is_auto_compaction_disabled_by_user()
                );
                return Ok(());
            }
            if !mgr.can_register_compaction(&t, weight, descriptor.fan_in()) {
                debug!(
                    "refused compaction job ({} sstable(s)) of weight {} for {}, postponing it",
                    descriptor.sstables.len(),
                    weight,
                    t.schema()
                );
                task.switch_state(TaskState::Postponed);
                mgr.postpone_compaction_for_table(&t);
                return Ok(());
            }

            let compacting = Arc::new(CompactingRegistration::with_sstables(
                mgr.registry(),
                &descriptor.sstables,
            ));
            let mut weight_registration =
                WeightRegistration::new(mgr.weights(), mgr.reevaluation_signal(), weight);
            debug!(
                "accepted compaction job ({} sstable(s)) of weight {} for {}",
                descriptor.sstables.len(),
                weight,
                t.schema()
            );

            task.setup_new_compaction(descriptor.run_identifier, descriptor.fan_in());
            let update_history = should_update_history(descriptor.options.compaction_type());

            match task
                .compact_sstables(descriptor, compacting.clone(), true)
                .await
            {
                Ok(res) => {
                    task.finish_compaction(TaskState::Done);
                    if update_history {
                        // History updates can be slow and there is no reason
                        // to hold back a same-weight job while one is in
                        // flight; free the weight first.
                        weight_registration.deregister();
                        if let Err(e) = task.update_history(&res).await {
                            task.finish_compaction(TaskState::Failed);
                            match task.maybe_retry(e).await? {
                                RetryOutcome::Retry => continue,
                                RetryOutcome::Finished => return Ok(()),
                            }
                        }
                    }
                    mgr.reevaluate_postponed_compactions();
                    continue;
                }
                Err(e) => {
                    task.finish_compaction(TaskState::Failed);
                    match task.maybe_retry(e).await? {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Finished => return Ok(()),
                    }
                }
            }
        }
    }
}

/// User-requested compaction subsuming all eligible files of a table.
///
/// Ordering rule: the maintenance semaphore is taken before the table's
/// write lock, never the other way around, or a regular compaction holding
/// the read lock could wait forever behind the semaphore.
pub(crate) struct MajorCompactionTask;

#[async_trait]
impl TaskRun for MajorCompactionTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        task.switch_state(TaskState::Pending);
        let _units = task.acquire_semaphore(mgr.maintenance_sem()).await?;
        let write_lock = task
            .compaction_state()
            .lock
            .clone()
            .write_owned()
            .await;
        if !task.can_proceed() {
            return Ok(());
        }

        let t = task.table().clone();
        let strategy = t.get_compaction_strategy();
        let descriptor = strategy.get_major_compaction_job(&t, mgr.get_candidates(&t));
        let compacting = Arc::new(CompactingRegistration::with_sstables(
            mgr.registry(),
            &descriptor.sstables,
        ));
        task.setup_new_compaction(descriptor.run_identifier, descriptor.fan_in());

        info!(
            "user initiated compaction started on behalf of {}",
            t.schema()
        );
        let tracker = BacklogTracker::new(Box::new(UserInitiatedBacklogTracker::new(
            mgr.controller().backlog_of_shares(200.0),
            mgr.available_memory(),
        )));
        mgr.register_backlog_tracker(&tracker);

        // The sstables are registered and the backlog tracker is in place;
        // release the exclusive lock so regular compaction can run in
        // parallel to the major body.
        drop(write_lock);

        task.compact_sstables_and_update_history(descriptor, compacting, true)
            .await?;
        task.finish_compaction(TaskState::Done);
        Ok(())
    }
}

/// Engine-supplied job body for [`crate::CompactionManager::run_custom_job`].
pub type CustomJob =
    Box<dyn FnOnce(Arc<CompactionData>) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Arbitrary engine-supplied job run under the maintenance semaphore, e.g.
/// resharding or snapshot-related work that must not overlap other
/// maintenance.
pub(crate) struct CustomCompactionTask {
    job: Mutex<Option<CustomJob>>,
}

impl CustomCompactionTask {
    pub(crate) fn new(job: CustomJob) -> Self {
        Self {
            job: Mutex::new(Some(job)),
        }
    }
}

#[async_trait]
impl TaskRun for CustomCompactionTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        if !task.can_proceed_or_throw()? {
            return Ok(());
        }
        task.switch_state(TaskState::Pending);
        let _units = task.acquire_semaphore(mgr.maintenance_sem()).await?;
        if !task.can_proceed_or_throw()? {
            return Ok(());
        }
        task.setup_new_compaction(None, 0);
        let job = self.job.lock().take().ok_or_else(|| Error::Unexpected {
            msg: "custom job already consumed".to_string(),
        })?;
        job(task.data()).await?;
        task.finish_compaction(TaskState::Done);
        Ok(())
    }
}

/// Reshapes the maintenance set until it satisfies the strategy invariant,
/// then installs the result into the main set in one transaction.
///
/// Sets are only updated at the end, on success; otherwise each round could
/// introduce overlap and progressively degrade reads until integration. The
/// cost is a 2x space requirement, kept in check by serializing off-strategy
/// across all tables so the bound is the largest maintenance set.
pub(crate) struct OffstrategyCompactionTask {
    performed: AtomicBool,
}

impl OffstrategyCompactionTask {
    pub(crate) fn new() -> Self {
        Self {
            performed: AtomicBool::new(false),
        }
    }

    pub(crate) fn performed(&self) -> bool {
        self.performed.load(Ordering::SeqCst)
    }

    async fn run_offstrategy_compaction(&self, task: &Arc<Task>) -> Result<(), Error> {
        let t = task.table().clone();
        let old_sstables = t.maintenance_sstables();
        let mut reshape_candidates = old_sstables.clone();
        let mut sstables_to_remove: Vec<SsTableHandle> = Vec::new();
        let mut new_unused_sstables: HashSet<SsTableHandle> = HashSet::new();

        let result = self
            .reshape_until_done(
                task,
                &mut reshape_candidates,
                &mut sstables_to_remove,
                &mut new_unused_sstables,
            )
            .await;
        if let Err(e) = result {
            for sst in new_unused_sstables {
                sst.mark_for_deletion();
            }
            return Err(e);
        }

        // reshape_candidates is now ready for integration into the main set
        t.on_compaction_completion(
            CompactionCompletionDesc {
                old_sstables,
                new_sstables: reshape_candidates,
            },
            true,
        )
        .await
        .inspect_err(|_| {
            for sst in &new_unused_sstables {
                sst.mark_for_deletion();
            }
        })?;

        // Inputs that originated in the maintenance set are only marked for
        // deletion: files that still require view building stay in the
        // staging directory until their time comes, and view building can
        // resume after a crash.
        for sst in sstables_to_remove {
            sst.mark_for_deletion();
        }
        Ok(())
    }

    async fn reshape_until_done(
        &self,
        task: &Arc<Task>,
        reshape_candidates: &mut Vec<SsTableHandle>,
        sstables_to_remove: &mut Vec<SsTableHandle>,
        new_unused_sstables: &mut HashSet<SsTableHandle>,
    ) -> Result<(), Error> {
        let mgr = task.manager().clone();
        let t = task.table().clone();
        let strategy = t.get_compaction_strategy();

        loop {
            let descriptor =
                strategy.get_reshaping_job(reshape_candidates.clone(), ReshapeMode::Strict);
            if descriptor.is_empty() {
                return Ok(());
            }
            let input: HashSet<SsTableHandle> = descriptor.sstables.iter().cloned().collect();

            let ret = mgr
                .executor()
                .compact_sstables(descriptor, task.data(), &t, None)
                .await?;
            self.performed.store(true, Ordering::SeqCst);

            // the candidate list loses this round's input and gains its output
            reshape_candidates.retain(|s| !input.contains(s));
            reshape_candidates.extend(ret.new_sstables.iter().cloned());
            new_unused_sstables.extend(ret.new_sstables.iter().cloned());

            // An sstable produced by an earlier round and fully consumed by
            // this one is dead weight; unlink it immediately to keep the
            // off-strategy space requirement down. Maintenance-set inputs
            // can only be removed after the final set update.
            for sst in input {
                if new_unused_sstables.remove(&sst) {
                    sst.unlink();
                } else {
                    sstables_to_remove.push(sst);
                }
            }
        }
    }
}

#[async_trait]
impl TaskRun for OffstrategyCompactionTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        loop {
            if !task.can_proceed() {
                return Ok(());
            }
            task.switch_state(TaskState::Pending);
            // serialized across all tables on this shard
            let _units = task.acquire_semaphore(mgr.offstrategy_sem()).await?;
            if !task.can_proceed() {
                return Ok(());
            }
            task.setup_new_compaction(None, 0);

            let t = task.table().clone();
            info!(
                "starting off-strategy compaction for {}, {} candidates were found",
                t.schema(),
                t.maintenance_sstables().len()
            );
            match self.run_offstrategy_compaction(task).await {
                Ok(()) => {
                    task.finish_compaction(TaskState::Done);
                    info!("done with off-strategy compaction for {}", t.schema());
                    return Ok(());
                }
                Err(e) => {
                    task.finish_compaction(TaskState::Failed);
                    match task.maybe_retry(e).await? {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Finished => return Ok(()),
                    }
                }
            }
        }
    }
}

/// A worklist of sstables sorted by descending size, consumed from the back
/// so the smallest file is rewritten first. The remaining list counts into
/// the manager's pending stats.
pub(crate) struct SstableQueue {
    mgr: Arc<ManagerInner>,
    sstables: Mutex<Vec<SsTableHandle>>,
}

impl SstableQueue {
    pub(crate) fn new(mgr: Arc<ManagerInner>, mut sstables: Vec<SsTableHandle>) -> Self {
        sstables.sort_by_key(|b| std::cmp::Reverse(b.data_size()));
        mgr.stats().pending_tasks.add(sstables.len() as i64);
        Self {
            mgr,
            sstables: Mutex::new(sstables),
        }
    }

    fn consume(&self) -> Option<SsTableHandle> {
        let sst = self.sstables.lock().pop();
        if sst.is_some() {
            self.mgr.stats().pending_tasks.dec();
        }
        sst
    }

    fn is_empty(&self) -> bool {
        self.sstables.lock().is_empty()
    }
}

impl Drop for SstableQueue {
    fn drop(&mut self) {
        let remaining = self.sstables.get_mut().len() as i64;
        self.mgr.stats().pending_tasks.sub(remaining);
    }
}

/// Rewrites chosen sstables one at a time: cleanup, format upgrade and
/// scrub-in-rewrite-mode all share this path, differing only in descriptor
/// options and tombstone purging.
pub(crate) struct RewriteSstablesTask {
    options: CompactionOptions,
    queue: SstableQueue,
    compacting: Arc<CompactingRegistration>,
    can_purge: bool,
}

impl RewriteSstablesTask {
    pub(crate) fn new(
        mgr: Arc<ManagerInner>,
        options: CompactionOptions,
        sstables: Vec<SsTableHandle>,
        compacting: Arc<CompactingRegistration>,
        can_purge: bool,
    ) -> Self {
        Self {
            options,
            queue: SstableQueue::new(mgr, sstables),
            compacting,
            can_purge,
        }
    }

    async fn rewrite_sstable(&self, task: &Arc<Task>, sst: SsTableHandle) -> Result<(), Error> {
        let mgr = task.manager().clone();
        loop {
            task.switch_state(TaskState::Active);
            let run_id = sst.run_id();
            let descriptor =
                CompactionDescriptor::new(vec![sst.clone()], self.options.clone())
                    .with_run_identifier(run_id)
                    .with_level(sst.level());

            task.setup_new_compaction(Some(run_id), descriptor.fan_in());

            let tracker = BacklogTracker::new(Box::new(UserInitiatedBacklogTracker::new(
                mgr.controller().backlog_of_shares(200.0),
                mgr.available_memory(),
            )));
            mgr.register_backlog_tracker(&tracker);

            match task
                .compact_sstables_and_update_history(
                    descriptor,
                    self.compacting.clone(),
                    self.can_purge,
                )
                .await
            {
                Ok(()) => {
                    task.finish_compaction(TaskState::Done);
                    mgr.reevaluate_postponed_compactions();
                    return Ok(());
                }
                Err(e) => {
                    task.finish_compaction(TaskState::Failed);
                    match task.maybe_retry(e).await? {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Finished => return Ok(()),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TaskRun for RewriteSstablesTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        task.switch_state(TaskState::Pending);
        let _units = task.acquire_semaphore(mgr.maintenance_sem()).await?;

        while !self.queue.is_empty() && task.can_proceed() {
            if let Some(sst) = self.queue.consume() {
                self.rewrite_sstable(task, sst).await?;
            }
        }
        Ok(())
    }
}

/// Cleanup splits its candidates into strategy-chosen jobs, run smallest
/// first so early jobs free space for the larger ones under disk pressure.
pub(crate) struct CleanupSstablesTask {
    options: CompactionOptions,
    jobs: Mutex<Vec<CompactionDescriptor>>,
    compacting: Arc<CompactingRegistration>,
    mgr: Arc<ManagerInner>,
}

impl CleanupSstablesTask {
    pub(crate) fn new(
        mgr: Arc<ManagerInner>,
        options: CompactionOptions,
        mut jobs: Vec<CompactionDescriptor>,
        compacting: Arc<CompactingRegistration>,
    ) -> Self {
        jobs.sort_by_key(|d| std::cmp::Reverse(d.sstables_size()));
        mgr.stats().pending_tasks.add(jobs.len() as i64);
        Self {
            options,
            jobs: Mutex::new(jobs),
            compacting,
            mgr,
        }
    }

    async fn run_cleanup_job(
        &self,
        task: &Arc<Task>,
        mut descriptor: CompactionDescriptor,
    ) -> Result<(), Error> {
        let mgr = task.manager().clone();
        descriptor.options = self.options.clone();
        loop {
            let tracker = BacklogTracker::new(Box::new(UserInitiatedBacklogTracker::new(
                mgr.controller().backlog_of_shares(200.0),
                mgr.available_memory(),
            )));
            mgr.register_backlog_tracker(&tracker);

            task.setup_new_compaction(descriptor.run_identifier, descriptor.fan_in());
            match task
                .compact_sstables_and_update_history(
                    descriptor.clone(),
                    self.compacting.clone(),
                    true,
                )
                .await
            {
                Ok(()) => {
                    task.finish_compaction(TaskState::Done);
                    mgr.reevaluate_postponed_compactions();
                    return Ok(());
                }
                Err(e) => {
                    task.finish_compaction(TaskState::Failed);
                    match task.maybe_retry(e).await? {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Finished => return Ok(()),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TaskRun for CleanupSstablesTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        let mgr = task.manager().clone();
        task.switch_state(TaskState::Pending);
        let _units = task.acquire_semaphore(mgr.maintenance_sem()).await?;

        loop {
            if !task.can_proceed() {
                return Ok(());
            }
            let job = self.jobs.lock().last().cloned();
            let Some(job) = job else {
                return Ok(());
            };
            self.run_cleanup_job(task, job).await?;
            self.jobs.lock().pop();
            self.mgr.stats().pending_tasks.dec();
        }
    }
}

impl Drop for CleanupSstablesTask {
    fn drop(&mut self) {
        let remaining = self.jobs.get_mut().len() as i64;
        self.mgr.stats().pending_tasks.sub(remaining);
    }
}

/// Scrub in validate mode: a read-only pass over a snapshot of *all*
/// sstables of the table, including ones being compacted. Corruption is
/// counted and logged per file; nothing is rewritten, and errors don't stop
/// the remaining files from being checked.
pub(crate) struct ValidateSstablesTask {
    queue: SstableQueue,
}

impl ValidateSstablesTask {
    pub(crate) fn new(mgr: Arc<ManagerInner>, sstables: Vec<SsTableHandle>) -> Self {
        Self {
            queue: SstableQueue::new(mgr, sstables),
        }
    }

    async fn validate_sstable(&self, task: &Arc<Task>, sst: SsTableHandle) -> Result<(), Error> {
        let mgr = task.manager().clone();
        task.switch_state(TaskState::Active);
        let descriptor = CompactionDescriptor::new(
            vec![sst.clone()],
            CompactionOptions::Scrub {
                options: ScrubOptions {
                    mode: ScrubMode::Validate,
                    quarantine_mode: QuarantineMode::Include,
                },
            },
        )
        .with_run_identifier(sst.run_id())
        .with_level(sst.level());

        match mgr
            .executor()
            .compact_sstables(descriptor, task.data(), task.table(), None)
            .await
        {
            Ok(_) => Ok(()),
            // a stop is noticed by the caller's can_proceed check
            Err(Error::Stopped { .. }) => Ok(()),
            Err(e @ Error::StorageIo(_)) => {
                error!(
                    "{}: failed due to storage I/O error: {}: stopping",
                    task.describe(),
                    e
                );
                mgr.stats().failed_tasks.inc();
                mgr.do_stop();
                Err(e)
            }
            Err(e) => {
                // validating potentially corrupt sstables, errors are
                // expected; move on to the next file
                mgr.stats().failed_tasks.inc();
                error!(
                    "scrubbing in validate mode {} failed: {}, continuing",
                    sst.id(),
                    e
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TaskRun for ValidateSstablesTask {
    async fn do_run(&self, task: &Arc<Task>) -> Result<(), Error> {
        while !self.queue.is_empty() && task.can_proceed() {
            if let Some(sst) = self.queue.consume() {
                self.validate_sstable(task, sst).await?;
            }
        }
        Ok(())
    }
}
