//! The compaction manager: a per-shard coordinator that schedules, admits,
//! supervises and throttles the background jobs rewriting a table's
//! sstables.
//!
//! The manager composes a handful of cooperating pieces:
//!
//! - admission: a weight multiset plus a fan-in threshold decide which
//!   regular compactions may run concurrently ([`ManagerInner::can_register_compaction`]);
//! - a per-task state machine with retry and failure escalation
//!   ([`crate::task`], [`crate::tasks`]);
//! - per-table locking and scoped disabling ([`CompactionState`],
//!   [`CompactionReenabler`]);
//! - a postponement set re-evaluated by a dedicated fiber whenever capacity
//!   frees up;
//! - backlog aggregation feeding the I/O controller
//!   ([`crate::backlog`], [`crate::controller`]).
//!
//! All shard state lives behind non-suspending mutexes; tasks only suspend
//! at lock/semaphore acquisition, engine calls, and retry sleeps.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backlog::{BacklogManager, BacklogTracker};
use crate::clock::SystemClock;
use crate::compaction::{
    CompactionExecutor, CompactionInfo, CompactionOptions, CompactionType, QuarantineMode,
    ScrubMode, ScrubOptions,
};
use crate::config::{CompactionManagerConfig, CompactionManagerOptions};
use crate::controller::{backlog_disabled, CompactionController, SchedulingGroup, NORMALIZATION_FACTOR};
use crate::error::Error;
use crate::registration::{CompactingRegistration, CompactingRegistry, WeightTracker};
use crate::sstable::{needs_cleanup, SsTableHandle, TokenRange};
use crate::stats::StatRegistry;
use crate::strategy::StrategyControl;
use crate::table_state::{in_strategy_sstables, table_key, TableHandle, TableKey};
use crate::task::Task;
use crate::tasks::{
    CleanupSstablesTask, CustomCompactionTask, CustomJob, MajorCompactionTask,
    OffstrategyCompactionTask, RegularCompactionTask, RewriteSstablesTask, TaskRun,
    ValidateSstablesTask,
};
use crate::utils::{Condvar, Gate, WatchableOnceCell};

/// Lifecycle of the manager itself.
///
/// `None` is the just-constructed state; once out of it the manager never
/// returns there. `Enabled` and `Disabled` may alternate. `Stopped` is
/// terminal: the manager can no longer be used beyond stats queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ManagerState {
    None,
    Enabled,
    Disabled,
    Stopped,
}

/// Per-table coordination state, created on `add` and torn down on `remove`.
pub(crate) struct CompactionState {
    /// Held (shared) by every task and disable scope touching the table;
    /// closed when the table is removed.
    pub(crate) gate: Gate,

    /// Regular compactions hold this for read; major takes it for write
    /// during setup so the two serialize there and nowhere else.
    pub(crate) lock: Arc<tokio::sync::RwLock<()>>,

    compaction_disabled_counter: AtomicI64,

    /// Signaled whenever a compaction round on the table completes.
    pub(crate) compaction_done: Condvar,
}

impl CompactionState {
    fn new() -> Self {
        Self {
            gate: Gate::new(),
            lock: Arc::new(tokio::sync::RwLock::new(())),
            compaction_disabled_counter: AtomicI64::new(0),
            compaction_done: Condvar::new(),
        }
    }

    pub(crate) fn compaction_disabled(&self) -> bool {
        self.compaction_disabled_counter.load(Ordering::SeqCst) > 0
    }
}

struct TableEntry {
    table: TableHandle,
    state: Arc<CompactionState>,
}

#[derive(Default)]
struct Fibers {
    reevaluation: Option<JoinHandle<()>>,
    submission: Option<JoinHandle<()>>,
    throughput: Option<JoinHandle<()>>,
    static_shares: Option<JoinHandle<()>>,
    abort_watcher: Option<JoinHandle<()>>,
}

pub(crate) struct ManagerInner {
    options: CompactionManagerOptions,
    compaction_group: SchedulingGroup,
    #[allow(dead_code)]
    maintenance_group: SchedulingGroup,
    available_memory: u64,
    executor: Arc<dyn CompactionExecutor>,
    clock: Arc<dyn SystemClock>,

    state: Mutex<ManagerState>,
    tables: Mutex<HashMap<TableKey, TableEntry>>,
    tasks: Mutex<Vec<Arc<Task>>>,

    registry: Arc<CompactingRegistry>,
    weights: Arc<WeightTracker>,

    /// Tables whose compaction was refused by admission, awaiting
    /// re-evaluation.
    postponed: Mutex<HashMap<TableKey, TableHandle>>,
    reevaluation: Arc<Notify>,

    /// Serializes all maintenance (non-regular) compaction activity to keep
    /// aggressiveness and space requirements down. Operations that must also
    /// serialize with regular take the per-table write lock.
    maintenance_sem: Arc<Semaphore>,

    /// Serializes off-strategy compaction across all tables on this shard,
    /// bounding its space requirement and protecting candidates from being
    /// picked twice.
    offstrategy_sem: Arc<Semaphore>,

    controller: Arc<CompactionController>,
    backlog_manager: BacklogManager,
    strategy_control: Arc<dyn StrategyControl>,

    stats: Arc<stats::CompactionManagerStats>,
    stop_result: WatchableOnceCell<()>,
    fibers: Mutex<Fibers>,
    fiber_cancel: CancellationToken,
}

impl ManagerInner {
    fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    pub(crate) fn options(&self) -> &CompactionManagerOptions {
        &self.options
    }

    pub(crate) fn stats(&self) -> &stats::CompactionManagerStats {
        &self.stats
    }

    pub(crate) fn executor(&self) -> &Arc<dyn CompactionExecutor> {
        &self.executor
    }

    pub(crate) fn controller(&self) -> &Arc<CompactionController> {
        &self.controller
    }

    pub(crate) fn available_memory(&self) -> u64 {
        self.available_memory
    }

    pub(crate) fn registry(&self) -> Arc<CompactingRegistry> {
        self.registry.clone()
    }

    pub(crate) fn weights(&self) -> Arc<WeightTracker> {
        self.weights.clone()
    }

    pub(crate) fn reevaluation_signal(&self) -> Arc<Notify> {
        self.reevaluation.clone()
    }

    pub(crate) fn maintenance_sem(&self) -> &Arc<Semaphore> {
        &self.maintenance_sem
    }

    pub(crate) fn offstrategy_sem(&self) -> &Arc<Semaphore> {
        &self.offstrategy_sem
    }

    pub(crate) fn get_strategy_control(&self) -> &Arc<dyn StrategyControl> {
        &self.strategy_control
    }

    pub(crate) fn compaction_state(&self, key: TableKey) -> Option<Arc<CompactionState>> {
        self.tables.lock().get(&key).map(|e| e.state.clone())
    }

    /// True if the manager is enabled, the table is still registered, and
    /// compaction isn't scope-disabled for it.
    pub(crate) fn can_proceed_for(&self, key: TableKey) -> bool {
        if self.state() != ManagerState::Enabled {
            return false;
        }
        self.tables
            .lock()
            .get(&key)
            .is_some_and(|e| !e.state.compaction_disabled())
    }

    pub(crate) fn register_backlog_tracker(&self, tracker: &BacklogTracker) {
        self.backlog_manager.register_backlog_tracker(tracker);
    }

    /// Aggregate backlog across all registered trackers, also refreshing the
    /// exported gauges.
    pub(crate) fn backlog(&self) -> f64 {
        let backlog = self.backlog_manager.backlog();
        self.stats.backlog.set(backlog);
        self.stats
            .normalized_backlog
            .set(backlog / self.available_memory as f64);
        backlog
    }

    /// The largest fan-in of currently running compactions, capped at 32 so
    /// small sstables can't pile up behind a major on a leveled table with
    /// over a thousand files.
    fn current_compaction_fan_in_threshold(&self) -> u32 {
        let tasks = self.tasks.lock();
        if tasks.is_empty() {
            return 0;
        }
        let largest_fan_in = tasks
            .iter()
            .map(|t| {
                if t.compaction_running() {
                    t.data().compaction_fan_in()
                } else {
                    0
                }
            })
            .max()
            .unwrap_or(0);
        std::cmp::min(32, largest_fan_in)
    }

    /// Admission policy for a regular compaction of weight `weight` and
    /// fan-in `fan_in` on table `t`.
    pub(crate) fn can_register_compaction(
        &self,
        t: &TableHandle,
        weight: i64,
        fan_in: u32,
    ) -> bool {
        // only one compaction at a time if the strategy can't run parallel
        if !t.get_compaction_strategy().parallel_compaction()
            && self.has_table_ongoing_compaction(t)
        {
            return false;
        }
        // weightless compaction doesn't have to be serialized, and won't
        // dilute overall efficiency
        if weight == 0 {
            return true;
        }
        if self.weights.contains(weight) {
            // an ongoing compaction owns this weight class
            return false;
        }
        // A compaction cannot proceed until its fan-in is greater than or
        // equal to the current largest fan-in, so a less efficient job never
        // dilutes a more efficient one. Distinctly sized jobs of equal
        // efficiency still run in parallel.
        if fan_in < self.current_compaction_fan_in_threshold() {
            return false;
        }
        true
    }

    /// Candidates for the strategy: eligible main-set sstables minus the
    /// ones being compacted and minus members of output runs still being
    /// generated (a partial run must never be picked).
    pub(crate) fn get_candidates(&self, t: &TableHandle) -> Vec<SsTableHandle> {
        let partial_run_ids: HashSet<uuid::Uuid> = {
            let tasks = self.tasks.lock();
            tasks
                .iter()
                .filter(|task| task.generating_output_run())
                .filter_map(|task| task.output_run_id())
                .collect()
        };
        let mut candidates = Vec::new();
        for sst in in_strategy_sstables(t) {
            if self.registry.contains(sst.id()) {
                continue;
            }
            if partial_run_ids.contains(&sst.run_id()) {
                continue;
            }
            candidates.push(sst);
        }
        candidates
    }

    pub(crate) fn has_table_ongoing_compaction(&self, t: &TableHandle) -> bool {
        let key = table_key(t);
        self.tasks
            .lock()
            .iter()
            .any(|task| task.table_key() == key && task.compaction_running())
    }

    pub(crate) fn postpone_compaction_for_table(&self, t: &TableHandle) {
        let mut postponed = self.postponed.lock();
        postponed.insert(table_key(t), t.clone());
        self.stats.postponed.set(postponed.len() as i64);
    }

    fn take_postponed(&self) -> Vec<TableHandle> {
        let mut postponed = self.postponed.lock();
        self.stats.postponed.set(0);
        std::mem::take(&mut *postponed).into_values().collect()
    }

    pub(crate) fn reevaluate_postponed_compactions(&self) {
        self.reevaluation.notify_one();
    }

    /// Let in-flight jobs of the table know that `removed` were swapped for
    /// `added` in its set, so their working view stays coherent.
    pub(crate) fn propagate_replacement(
        &self,
        t: &TableHandle,
        removed: &[SsTableHandle],
        added: &[SsTableHandle],
    ) {
        let key = table_key(t);
        let tasks = self.tasks.lock();
        for task in tasks.iter() {
            if task.table_key() == key && task.compaction_running() {
                task.data()
                    .push_pending_replacement(crate::compaction::SsTableReplacement {
                        removed: removed.to_vec(),
                        added: added.to_vec(),
                    });
            }
        }
    }

    /// Best-effort enqueue of a regular compaction for the table.
    pub(crate) fn submit(self: &Arc<Self>, t: &TableHandle) {
        if self.state() != ManagerState::Enabled || t.is_auto_compaction_disabled_by_user() {
            return;
        }
        match Task::new(
            self.clone(),
            t.clone(),
            CompactionType::Compaction,
            "Compaction",
        ) {
            Ok(task) => {
                let this = self.clone();
                // dropped future; waited via the task's completion cell
                tokio::spawn(async move {
                    let _ = this.perform_task(task, Arc::new(RegularCompactionTask)).await;
                });
            }
            Err(e) => {
                debug!("cannot submit compaction for {}: {}", t.schema(), e);
            }
        }
    }

    /// Run a task to completion: track it in the task list, dispatch the
    /// flavor body, classify the outcome, and resolve the completion cell.
    #[instrument(level = "debug", skip_all, fields(id = %task.id()))]
    pub(crate) async fn perform_task(
        self: &Arc<Self>,
        task: Arc<Task>,
        runner: Arc<dyn TaskRun>,
    ) -> Result<(), Error> {
        self.tasks.lock().push(task.clone());
        debug!("{}: started", task.describe());

        let result = runner.do_run(&task).await;

        {
            let mut tasks = self.tasks.lock();
            if let Some(pos) = tasks.iter().position(|t| Arc::ptr_eq(t, &task)) {
                tasks.remove(pos);
            }
        }

        let outcome = match result {
            Ok(()) => {
                debug!("{}: done", task.describe());
                Ok(())
            }
            Err(e) if e.is_stopped() => {
                info!("{}: stopped, reason: {}", task.describe(), e);
                Ok(())
            }
            Err(e @ Error::Aborted { .. }) => {
                error!("{}: aborted, reason: {}", task.describe(), e);
                self.stats.failed_tasks.inc();
                Err(e)
            }
            Err(e @ Error::StorageIo(_)) => {
                error!(
                    "{}: failed due to storage io error: {}: stopping",
                    task.describe(),
                    e
                );
                self.stats.failed_tasks.inc();
                self.do_stop();
                Err(e)
            }
            Err(e) => {
                error!("{}: failed, reason: {}", task.describe(), e);
                self.stats.failed_tasks.inc();
                Err(e)
            }
        };
        task.complete(outcome.clone());
        outcome
    }

    async fn stop_tasks(&self, tasks: Vec<Arc<Task>>, reason: &str) -> Result<(), Error> {
        // To prevent compaction from being postponed while tasks are being
        // stopped, stop all of them before the first suspension point below.
        for task in &tasks {
            debug!("stopping {}", task.describe());
            task.stop(reason);
        }
        let results = join_all(tasks.iter().map(|task| {
            let mut reader = task.completion_reader();
            async move { reader.await_value().await }
        }))
        .await;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!("stopping {}: done", task.describe());
                }
                Err(e) if e.is_stopped() => {
                    // swallow the stop exception if a given flavor decides
                    // to propagate it to the caller
                }
                Err(e) => {
                    debug!("stopping {}: task returned error: {}", task.describe(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn stop_ongoing_compactions(
        &self,
        reason: &str,
        t: Option<&TableHandle>,
        type_filter: Option<CompactionType>,
    ) -> Result<(), Error> {
        let ongoing_compactions = self.get_compactions(t).len();
        let key = t.map(table_key);
        let tasks: Vec<Arc<Task>> = {
            let tasks = self.tasks.lock();
            tasks
                .iter()
                .filter(|task| {
                    key.is_none_or(|k| task.table_key() == k)
                        && type_filter.is_none_or(|ty| task.kind() == ty)
                })
                .cloned()
                .collect()
        };
        let mut scope = String::new();
        if let Some(t) = t {
            scope = format!(" for table {}", t.schema());
        }
        if let Some(ty) = type_filter {
            scope += &format!(" {} type={}", if scope.is_empty() { "for" } else { "and" }, ty);
        }
        if tasks.is_empty() {
            debug!(
                "stopping 0 tasks for {} ongoing compactions{} due to {}",
                ongoing_compactions, scope, reason
            );
        } else {
            info!(
                "stopping {} tasks for {} ongoing compactions{} due to {}",
                tasks.len(),
                ongoing_compactions,
                scope,
                reason
            );
        }
        self.stop_tasks(tasks, reason).await
    }

    pub(crate) fn get_compactions(&self, t: Option<&TableHandle>) -> Vec<CompactionInfo> {
        let key = t.map(table_key);
        let tasks = self.tasks.lock();
        tasks
            .iter()
            .filter(|task| key.is_none_or(|k| task.table_key() == k) && task.compaction_running())
            .map(|task| {
                let data = task.data();
                let schema = task.table().schema();
                CompactionInfo {
                    compaction_uuid: data.compaction_uuid(),
                    compaction_type: task.kind(),
                    ks_name: schema.ks_name.clone(),
                    cf_name: schema.cf_name.clone(),
                    total_partitions: data.total_partitions(),
                    total_keys_written: data.total_keys_written(),
                }
            })
            .collect()
    }

    async fn update_throughput(&self, value_mbs: u32) {
        let effective = if value_mbs != 0 {
            value_mbs as u64
        } else {
            u32::MAX as u64
        };
        let bps = effective << 20;
        match self.compaction_group.io.update_bandwidth(bps).await {
            Err(e) => warn!("couldn't update compaction bandwidth: {}", e),
            Ok(()) if value_mbs != 0 => info!("set compaction bandwidth to {}MB/s", value_mbs),
            Ok(()) => info!("set unlimited compaction bandwidth"),
        }
    }

    /// Stop all fibers without waiting. Safe to call multiple times; the
    /// heavy lifting happens once, in a spawned stop task awaited by
    /// [`CompactionManager::stop`].
    pub(crate) fn do_stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ManagerState::None | ManagerState::Stopped) {
                return;
            }
            *state = ManagerState::Stopped;
        }
        let this = self.clone();
        let stop_result = self.stop_result.clone();
        crate::utils::spawn_bg_task(
            &tokio::runtime::Handle::current(),
            move |result| {
                if let Err(e) = result {
                    error!("stop task failed [error={}]", e);
                    // never leave stop() waiters hanging
                    stop_result.write(());
                }
            },
            async move {
                this.really_do_stop().await;
                Ok(())
            },
        );
    }

    async fn really_do_stop(self: Arc<Self>) {
        info!("asked to stop");
        if let Err(e) = self.stop_ongoing_compactions("shutdown", None, None).await {
            warn!("error stopping ongoing compactions on shutdown: {}", e);
        }
        // wake the re-evaluation fiber so it drains the postponed set and
        // exits
        self.reevaluation.notify_one();
        let fibers = {
            let mut fibers = self.fibers.lock();
            std::mem::take(&mut *fibers)
        };
        if let Some(handle) = fibers.reevaluation {
            let _ = handle.await;
        }
        self.weights.clear();
        self.fiber_cancel.cancel();
        for handle in [
            fibers.submission,
            fibers.throughput,
            fibers.static_shares,
            fibers.abort_watcher,
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.await;
        }
        self.controller.shutdown().await;
        self.stop_result.write(());
        info!("stopped");
    }
}

/// Scoped disable of compaction for one table. Construction bumps the
/// table's disabled counter; drop decrements it and, if this was the last
/// holder and the table's gate is still open, resubmits regular compaction.
pub struct CompactionReenabler {
    mgr: Arc<ManagerInner>,
    table: Option<TableHandle>,
    cstate: Arc<CompactionState>,
    _holder: crate::utils::GateHolder,
}

impl CompactionReenabler {
    fn new(mgr: Arc<ManagerInner>, table: TableHandle) -> Result<Self, Error> {
        let cstate = mgr
            .compaction_state(table_key(&table))
            .ok_or_else(|| Error::TableNotFound {
                table: table.schema().to_string(),
            })?;
        let holder = cstate.gate.hold().ok_or_else(|| Error::GateClosed {
            table: table.schema().to_string(),
        })?;
        let counter = cstate
            .compaction_disabled_counter
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        debug!(
            "temporarily disabled compaction for {}. compaction_disabled_counter={}",
            table.schema(),
            counter
        );
        Ok(Self {
            mgr,
            table: Some(table),
            cstate,
            _holder: holder,
        })
    }

    pub fn compacting_table(&self) -> Option<&TableHandle> {
        self.table.as_ref()
    }
}

impl Drop for CompactionReenabler {
    fn drop(&mut self) {
        let Some(table) = self.table.take() else {
            return;
        };
        // resubmit only if we're the last holder and the gate is still open
        if self
            .cstate
            .compaction_disabled_counter
            .fetch_sub(1, Ordering::SeqCst)
            == 1
            && !self.cstate.gate.is_closed()
        {
            debug!("reenabling compaction for {}", table.schema());
            self.mgr.submit(&table);
        }
    }
}

/// Snapshot of the manager-wide task counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub pending_tasks: i64,
    pub active_tasks: i64,
    pub completed_tasks: i64,
    pub errors: i64,
    pub postponed: i64,
}

/// Compaction manager public surface. Cheap to clone via the inner `Arc`.
pub struct CompactionManager {
    inner: Arc<ManagerInner>,
}

impl Clone for CompactionManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl CompactionManager {
    /// Build a manager. Must be called within a tokio runtime: the
    /// throughput/static-shares observers and the external-abort watcher are
    /// spawned here.
    pub fn new(
        config: CompactionManagerConfig,
        executor: Arc<dyn CompactionExecutor>,
        stat_registry: &StatRegistry,
        clock: Arc<dyn SystemClock>,
        abort: CancellationToken,
    ) -> Self {
        let CompactionManagerConfig {
            compaction_group,
            maintenance_group,
            available_memory,
            static_shares,
            static_shares_updates,
            throughput_mb_per_sec_updates,
            options,
        } = config;
        let stats = Arc::new(stats::CompactionManagerStats::new(stat_registry));
        let available_memory = available_memory.max(1);
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let controller = Arc::new(CompactionController::new(static_shares, {
                let weak = weak.clone();
                Box::new(move || {
                    let Some(inner) = weak.upgrade() else {
                        return 0.0;
                    };
                    let normalized = inner.backlog() / inner.available_memory as f64;
                    if backlog_disabled(normalized) {
                        // an unimplemented strategy backlog maps to maximum
                        // controller output
                        NORMALIZATION_FACTOR
                    } else {
                        normalized
                    }
                })
            }));
            let strategy_control: Arc<dyn StrategyControl> = Arc::new(ManagerStrategyControl {
                inner: weak.clone(),
            });
            ManagerInner {
                options,
                compaction_group,
                maintenance_group,
                available_memory,
                executor,
                clock,
                state: Mutex::new(ManagerState::None),
                tables: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                registry: Arc::new(CompactingRegistry::new()),
                weights: Arc::new(WeightTracker::new()),
                postponed: Mutex::new(HashMap::new()),
                reevaluation: Arc::new(Notify::new()),
                maintenance_sem: Arc::new(Semaphore::new(1)),
                offstrategy_sem: Arc::new(Semaphore::new(1)),
                backlog_manager: BacklogManager::new(controller.clone()),
                controller,
                strategy_control,
                stats,
                stop_result: WatchableOnceCell::new(),
                fibers: Mutex::new(Fibers::default()),
                fiber_cancel: CancellationToken::new(),
            }
        });

        let manager = Self { inner };
        manager.spawn_abort_watcher(abort);
        if let Some(rx) = throughput_mb_per_sec_updates {
            manager.spawn_throughput_updater(rx);
        }
        if let Some(rx) = static_shares_updates {
            manager.spawn_static_shares_updater(rx);
        }
        manager
    }

    fn spawn_abort_watcher(&self, abort: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.fiber_cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.do_stop();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        self.inner.fibers.lock().abort_watcher = Some(handle);
    }

    fn spawn_throughput_updater(&self, mut rx: tokio::sync::watch::Receiver<u32>) {
        let inner = self.inner.clone();
        let cancel = inner.fiber_cancel.clone();
        let handle = tokio::spawn(async move {
            // start throttling (if configured) right away
            let initial = *rx.borrow_and_update();
            inner.update_throughput(initial).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let value = *rx.borrow_and_update();
                        inner.update_throughput(value).await;
                    }
                }
            }
        });
        self.inner.fibers.lock().throughput = Some(handle);
    }

    fn spawn_static_shares_updater(&self, mut rx: tokio::sync::watch::Receiver<f64>) {
        let inner = self.inner.clone();
        let cancel = inner.fiber_cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let shares = *rx.borrow_and_update();
                        if let Err(e) = inner.controller.update_static_shares(shares).await {
                            warn!("couldn't update static shares: {}", e);
                        }
                    }
                }
            }
        });
        self.inner.fibers.lock().static_shares = Some(handle);
    }

    /// Enable the manager: accept submissions, arm the periodic submission
    /// sweep, start re-evaluating postponed compactions.
    pub fn enable(&self) {
        {
            let mut state = self.inner.state.lock();
            assert!(
                matches!(*state, ManagerState::None | ManagerState::Disabled),
                "compaction manager enabled from state {:?}",
                *state
            );
            *state = ManagerState::Enabled;
        }
        self.spawn_reevaluation_fiber();
        self.spawn_submission_timer();
    }

    fn spawn_reevaluation_fiber(&self) {
        // after a drain/enable cycle the previous fiber may still be parked
        // on the signal; it only exits once it wakes while not enabled
        if self
            .inner
            .fibers
            .lock()
            .reevaluation
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                inner.reevaluation.notified().await;
                if inner.state() != ManagerState::Enabled {
                    inner.take_postponed();
                    return;
                }
                let postponed = inner.take_postponed();
                for t in postponed {
                    debug!("resubmitting postponed compaction for table {}", t.schema());
                    inner.submit(&t);
                }
            }
        });
        self.inner.fibers.lock().reevaluation = Some(handle);
    }

    fn spawn_submission_timer(&self) {
        if self
            .inner
            .fibers
            .lock()
            .submission
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return;
        }
        let inner = self.inner.clone();
        let cancel = inner.fiber_cancel.clone();
        let period = inner.options.periodic_submission_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; the sweep starts one period in
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let tables: Vec<TableHandle> = {
                            let tables = inner.tables.lock();
                            tables.values().map(|e| e.table.clone()).collect()
                        };
                        for t in tables {
                            inner.submit(&t);
                        }
                    }
                }
            }
        });
        self.inner.fibers.lock().submission = Some(handle);
    }

    /// Register a table. Creates the compaction state used for submitting
    /// jobs of all types on its behalf.
    pub fn add(&self, t: &TableHandle) {
        let key = table_key(t);
        let mut tables = self.inner.tables.lock();
        assert!(
            !tables.contains_key(&key),
            "compaction state for table {} already exists",
            t.schema()
        );
        tables.insert(
            key,
            TableEntry {
                table: t.clone(),
                state: Arc::new(CompactionState::new()),
            },
        );
    }

    /// Unregister a table: cancel its requests and wait for any ongoing
    /// compaction on its behalf.
    pub async fn remove(&self, t: &TableHandle) -> Result<(), Error> {
        let key = table_key(t);
        let entry = self.inner.tables.lock().remove(&key);
        if let Some(entry) = entry {
            {
                let mut postponed = self.inner.postponed.lock();
                postponed.remove(&key);
                self.inner.stats.postponed.set(postponed.len() as i64);
            }
            // A task being stopped must not retry against a removed table;
            // stop_ongoing_compactions provides that.
            self.inner
                .stop_ongoing_compactions("table removal", Some(t), None)
                .await?;
            // wait for all functions running under the gate to terminate
            entry.state.gate.close().await;
            entry.state.compaction_done.break_all();
        }
        #[cfg(debug_assertions)]
        {
            let tasks = self.inner.tasks.lock();
            for task in tasks.iter() {
                debug_assert!(
                    task.table_key() != key,
                    "found {} after remove",
                    task.describe()
                );
            }
        }
        Ok(())
    }

    /// Best-effort enqueue of a regular compaction if the manager is enabled
    /// and the user hasn't disabled auto-compaction on the table.
    pub fn submit(&self, t: &TableHandle) {
        self.inner.submit(t);
    }

    /// Whether a regular compaction could run on the table right now.
    pub fn can_perform_regular_compaction(&self, t: &TableHandle) -> bool {
        self.inner.can_proceed_for(table_key(t)) && !t.is_auto_compaction_disabled_by_user()
    }

    /// If the table has accumulated too many sstable runs, submit a
    /// compaction and wait until the run count drops to
    /// `max(max_compaction_threshold, 32)` or regular compaction on the
    /// table becomes impossible.
    pub async fn maybe_wait_for_sstable_count_reduction(
        &self,
        t: &TableHandle,
    ) -> Result<(), Error> {
        let schema = t.schema().clone();
        if !self.can_perform_regular_compaction(t) {
            trace!(
                "maybe_wait_for_sstable_count_reduction in {}: cannot perform regular compaction",
                schema
            );
            return Ok(());
        }
        let num_runs_for_compaction = || {
            let strategy = t.get_compaction_strategy();
            let desc = strategy.get_sstables_for_compaction(
                t,
                self.inner.get_strategy_control().as_ref(),
                self.inner.get_candidates(t),
            );
            desc.sstables
                .iter()
                .map(|sst| sst.run_id())
                .collect::<HashSet<_>>()
                .len()
        };
        let threshold = std::cmp::max(schema.max_compaction_threshold, 32);
        let count = num_runs_for_compaction();
        if count <= threshold {
            trace!(
                "no need to wait for sstable count reduction in {}: {} <= {}",
                schema,
                count,
                threshold
            );
            return Ok(());
        }
        // reduce the chances of an endless wait if compaction wasn't
        // scheduled for the table due to a problem
        self.submit(t);
        let start = self.inner.clock.now();
        let Some(cstate) = self.inner.compaction_state(table_key(t)) else {
            return Ok(());
        };
        let wait_result = cstate
            .compaction_done
            .wait_until(|| {
                num_runs_for_compaction() <= threshold || !self.can_perform_regular_compaction(t)
            })
            .await;
        if wait_result.is_err() {
            // condvar broken by table removal
            return Ok(());
        }
        let elapsed_ms = self
            .inner
            .clock
            .now()
            .duration_since(start)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        warn!(
            "waited {}ms for compaction of {} to catch up on {} sstable runs",
            elapsed_ms, schema, count
        );
        Ok(())
    }

    /// Submit a table for major compaction and wait for it to terminate.
    pub async fn perform_major_compaction(&self, t: &TableHandle) -> Result<(), Error> {
        if self.inner.state() != ManagerState::Enabled {
            return Ok(());
        }
        let task = Task::new(
            self.inner.clone(),
            t.clone(),
            CompactionType::Compaction,
            "Major compaction",
        )?;
        self.inner
            .perform_task(task, Arc::new(MajorCompactionTask))
            .await
    }

    /// Run a custom engine-supplied job under the maintenance semaphore.
    /// `compaction_type` is the type the operation is most closely
    /// associated with; use `Compaction` if none apply.
    pub async fn run_custom_job(
        &self,
        t: &TableHandle,
        compaction_type: CompactionType,
        description: &str,
        job: CustomJob,
    ) -> Result<(), Error> {
        if self.inner.state() != ManagerState::Enabled {
            return Ok(());
        }
        let task = Task::new(self.inner.clone(), t.clone(), compaction_type, description)?;
        self.inner
            .perform_task(task, Arc::new(CustomCompactionTask::new(job)))
            .await
    }

    /// Submit a table for off-strategy compaction. Returns true iff a
    /// reshape round actually ran.
    pub async fn perform_offstrategy(&self, t: &TableHandle) -> Result<bool, Error> {
        if self.inner.state() != ManagerState::Enabled {
            return Ok(false);
        }
        let runner = Arc::new(OffstrategyCompactionTask::new());
        let task = Task::new(
            self.inner.clone(),
            t.clone(),
            CompactionType::Reshape,
            "Offstrategy compaction",
        )?;
        self.inner.perform_task(task, runner.clone()).await?;
        Ok(runner.performed())
    }

    /// Rewrite the sstables chosen by `get_candidates`, one at a time. The
    /// selection runs with compaction disabled on the table, so no file can
    /// escape it by racing with a regular compaction.
    pub async fn rewrite_sstables<F, Fut>(
        &self,
        t: &TableHandle,
        options: CompactionOptions,
        get_candidates: F,
        can_purge: bool,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<SsTableHandle>, Error>>,
    {
        let compaction_type = options.compaction_type();
        self.perform_task_on_all_files(
            t,
            compaction_type,
            get_candidates,
            move |inner, sstables, compacting| {
                Arc::new(RewriteSstablesTask::new(
                    inner, options, sstables, compacting, can_purge,
                ))
            },
        )
        .await
    }

    async fn perform_task_on_all_files<F, Fut>(
        &self,
        t: &TableHandle,
        compaction_type: CompactionType,
        get_candidates: F,
        make_runner: impl FnOnce(
            Arc<ManagerInner>,
            Vec<SsTableHandle>,
            Arc<CompactingRegistration>,
        ) -> Arc<dyn TaskRun>,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<SsTableHandle>, Error>>,
    {
        if self.inner.state() != ManagerState::Enabled {
            return Ok(());
        }
        // There might be ongoing compactions, and every sstable that exists
        // when we run must be included in the rewrite; barrier out any
        // previously running compaction before picking candidates.
        let compacting = Arc::new(CompactingRegistration::new(self.inner.registry()));
        let sstables = {
            let compacting = compacting.clone();
            self.run_with_compaction_disabled(t, move || async move {
                // picking the candidates and registering them must be
                // atomic, or a regular compaction could grab the same files
                // in between
                let sstables = get_candidates().await?;
                compacting.register(&sstables);
                Ok(sstables)
            })
            .await?
        };
        let runner = make_runner(self.inner.clone(), sstables, compacting);
        let task = Task::new(
            self.inner.clone(),
            t.clone(),
            compaction_type,
            compaction_type.to_string(),
        )?;
        self.inner.perform_task(task, runner).await
    }

    /// Clean up sstables carrying keys outside the replica's owned token
    /// ranges. Fails if a cleanup is already ongoing on the table.
    pub async fn perform_cleanup(
        &self,
        sorted_owned_ranges: Vec<TokenRange>,
        t: &TableHandle,
    ) -> Result<(), Error> {
        let key = table_key(t);
        let has_cleanup = {
            let tasks = self.inner.tasks.lock();
            tasks
                .iter()
                .any(|task| task.table_key() == key && task.kind() == CompactionType::Cleanup)
        };
        if has_cleanup {
            return Err(Error::CleanupInProgress {
                table: t.schema().to_string(),
            });
        }
        let owned_ranges = Arc::new(sorted_owned_ranges);
        let options = CompactionOptions::Cleanup {
            owned_ranges: owned_ranges.clone(),
        };
        let inner = self.inner.clone();
        let table = t.clone();
        let get = {
            let owned_ranges = owned_ranges.clone();
            move || async move {
                let candidates = inner.get_candidates(&table);
                Ok(candidates
                    .into_iter()
                    .filter(|sst| owned_ranges.is_empty() || needs_cleanup(sst, &owned_ranges))
                    .collect())
            }
        };
        let table = t.clone();
        self.perform_task_on_all_files(
            t,
            CompactionType::Cleanup,
            get,
            move |inner, sstables, compacting| {
                let jobs = table
                    .get_compaction_strategy()
                    .get_cleanup_compaction_jobs(&table, sstables);
                Arc::new(CleanupSstablesTask::new(inner, options, jobs, compacting))
            },
        )
        .await
    }

    /// Rewrite sstables written in an older format version. With
    /// `exclude_current_version` only stale files are rewritten; otherwise
    /// everything is.
    pub async fn perform_sstable_upgrade(
        &self,
        t: &TableHandle,
        exclude_current_version: bool,
    ) -> Result<(), Error> {
        let inner = self.inner.clone();
        let table = t.clone();
        let get = move || async move {
            let last_version = table.highest_supported_format();
            Ok(inner
                .get_candidates(&table)
                .into_iter()
                .filter(|sst| !exclude_current_version || sst.format_version() < last_version)
                .collect())
        };
        // a cleanup-grade rewrite is as compacting as an upgrade needs to be
        self.rewrite_sstables(t, CompactionOptions::Upgrade, get, true)
            .await
    }

    /// Scrub the table's sstables in the chosen mode.
    pub async fn perform_sstable_scrub(
        &self,
        t: &TableHandle,
        opts: ScrubOptions,
    ) -> Result<(), Error> {
        if opts.mode == ScrubMode::Validate {
            return self.perform_sstable_scrub_validate_mode(t).await;
        }
        let table = t.clone();
        let get = move || async move {
            Ok(get_all_sstables(&table)
                .into_iter()
                .filter(|sst| {
                    if sst.requires_view_building() {
                        return false;
                    }
                    match opts.quarantine_mode {
                        QuarantineMode::Include => true,
                        QuarantineMode::Exclude => !sst.is_quarantined(),
                        QuarantineMode::Only => sst.is_quarantined(),
                    }
                })
                .collect())
        };
        self.rewrite_sstables(t, CompactionOptions::Scrub { options: opts }, get, false)
            .await
    }

    async fn perform_sstable_scrub_validate_mode(&self, t: &TableHandle) -> Result<(), Error> {
        if self.inner.state() != ManagerState::Enabled {
            return Ok(());
        }
        // every sstable is included, even ones being compacted, so the whole
        // table gets validated
        let all_sstables = get_all_sstables(t);
        let runner = Arc::new(ValidateSstablesTask::new(self.inner.clone(), all_sstables));
        let task = Task::new(
            self.inner.clone(),
            t.clone(),
            CompactionType::Scrub,
            "Scrub compaction in validate mode",
        )?;
        self.inner.perform_task(task, runner).await
    }

    /// Stop ongoing compactions of a named type, optionally scoped to one
    /// table. Validation and index-build jobs aren't tracked here, and
    /// stopping reshard is disallowed.
    pub async fn stop_compaction(
        &self,
        type_name: &str,
        t: Option<&TableHandle>,
    ) -> Result<(), Error> {
        let target_type: CompactionType = type_name.parse()?;
        match target_type {
            CompactionType::Validation | CompactionType::IndexBuild => {
                return Err(Error::InvalidArgument {
                    msg: format!("compaction type {} is unsupported", type_name),
                });
            }
            CompactionType::Reshard => {
                return Err(Error::InvalidArgument {
                    msg: format!("stopping compaction of type {} is disallowed", type_name),
                });
            }
            _ => {}
        }
        self.inner
            .stop_ongoing_compactions("user request", t, Some(target_type))
            .await
    }

    /// Stop ongoing compactions, optionally filtered by table and type.
    pub async fn stop_ongoing_compactions(
        &self,
        reason: &str,
        t: Option<&TableHandle>,
        type_filter: Option<CompactionType>,
    ) -> Result<(), Error> {
        self.inner
            .stop_ongoing_compactions(reason, t, type_filter)
            .await
    }

    /// Disable compaction for the table, stop whatever is running on it, and
    /// hand back a scope that re-enables on drop.
    pub async fn stop_and_disable_compaction(
        &self,
        t: &TableHandle,
    ) -> Result<CompactionReenabler, Error> {
        let reenabler = CompactionReenabler::new(self.inner.clone(), t.clone())?;
        self.inner
            .stop_ongoing_compactions("user-triggered operation", Some(t), None)
            .await?;
        Ok(reenabler)
    }

    /// Run `f` with compaction temporarily disabled for the table.
    pub async fn run_with_compaction_disabled<R, F, Fut>(
        &self,
        t: &TableHandle,
        f: F,
    ) -> Result<R, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R, Error>>,
    {
        let _reenabler = self.stop_and_disable_compaction(t).await?;
        f().await
    }

    /// Cancel all running compactions and move to the disabled state. The
    /// manager stays usable and can be enabled again.
    pub async fn drain(&self) {
        info!("asked to drain");
        let proceed = {
            let mut state = self.inner.state.lock();
            if *state == ManagerState::Stopped {
                false
            } else {
                *state = ManagerState::Disabled;
                true
            }
        };
        if proceed {
            if let Err(e) = self
                .inner
                .stop_ongoing_compactions("drain", None, None)
                .await
            {
                warn!("error stopping ongoing compactions on drain: {}", e);
            }
        }
        info!("drained");
    }

    /// Stop all fibers, waiting for ongoing compactions. Idempotent; should
    /// be called once from the main teardown path.
    pub async fn stop(&self) {
        if self.inner.state() == ManagerState::None {
            // never started
            return;
        }
        self.inner.do_stop();
        self.inner.stop_result.reader().await_value().await;
    }

    /// 0 means unlimited; any other value caps the compaction group's
    /// bandwidth at `value_mbs` MiB/s.
    pub async fn update_throughput(&self, value_mbs: u32) {
        self.inner.update_throughput(value_mbs).await;
    }

    /// Snapshot of the running jobs, optionally scoped to one table.
    pub fn get_compactions(&self, t: Option<&TableHandle>) -> Vec<CompactionInfo> {
        self.inner.get_compactions(t)
    }

    pub fn has_table_ongoing_compaction(&self, t: &TableHandle) -> bool {
        self.inner.has_table_ongoing_compaction(t)
    }

    pub fn compaction_disabled(&self, t: &TableHandle) -> bool {
        self.inner
            .compaction_state(table_key(t))
            .is_some_and(|s| s.compaction_disabled())
    }

    /// Aggregate compaction backlog across all tables of the shard.
    pub fn backlog(&self) -> f64 {
        self.inner.backlog()
    }

    pub fn register_backlog_tracker(&self, tracker: &BacklogTracker) {
        self.inner.register_backlog_tracker(tracker);
    }

    pub fn get_strategy_control(&self) -> Arc<dyn StrategyControl> {
        self.inner.get_strategy_control().clone()
    }

    pub fn get_stats(&self) -> Stats {
        let stats = self.inner.stats();
        Stats {
            pending_tasks: stats.pending_tasks.value(),
            active_tasks: stats.active_tasks.value(),
            completed_tasks: crate::stats::ReadableStat::get(stats.completed_tasks.as_ref()),
            errors: crate::stats::ReadableStat::get(stats.failed_tasks.as_ref()),
            postponed: stats.postponed.value(),
        }
    }
}

/// All sstables of the table, across the main and maintenance sets.
fn get_all_sstables(t: &TableHandle) -> Vec<SsTableHandle> {
    let mut all = t.main_sstables();
    all.extend(t.maintenance_sstables());
    all
}

struct ManagerStrategyControl {
    inner: Weak<ManagerInner>,
}

impl StrategyControl for ManagerStrategyControl {
    fn has_ongoing_compaction(&self, table: &TableHandle) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let schema = table.schema();
        let tasks = inner.tasks.lock();
        tasks.iter().any(|task| {
            task.compaction_running()
                && task.table().schema().ks_name == schema.ks_name
                && task.table().schema().cf_name == schema.cf_name
        })
    }
}

pub mod stats {
    use std::sync::Arc;

    use crate::stats::{Counter, Gauge, StatRegistry};

    macro_rules! compaction_manager_stat_name {
        ($suffix:expr) => {
            crate::stat_name!("compaction_manager", $suffix)
        };
    }

    /// Number of currently active compactions.
    pub const ACTIVE_COMPACTIONS: &str = compaction_manager_stat_name!("compactions");
    /// Number of compaction tasks waiting for an opportunity to run.
    pub const PENDING_COMPACTIONS: &str = compaction_manager_stat_name!("pending_compactions");
    /// Number of completed compaction tasks.
    pub const COMPLETED_COMPACTIONS: &str = compaction_manager_stat_name!("completed_compactions");
    /// Number of failed compaction tasks.
    pub const FAILED_COMPACTIONS: &str = compaction_manager_stat_name!("failed_compactions");
    /// Number of tables with postponed compaction.
    pub const POSTPONED_COMPACTIONS: &str = compaction_manager_stat_name!("postponed_compactions");
    /// Sum of compaction backlog for all tables on the shard.
    pub const BACKLOG: &str = compaction_manager_stat_name!("backlog");
    /// Backlog normalized by the shard's available memory.
    pub const NORMALIZED_BACKLOG: &str = compaction_manager_stat_name!("normalized_backlog");

    pub(crate) struct CompactionManagerStats {
        pub(crate) active_tasks: Arc<Gauge<i64>>,
        pub(crate) pending_tasks: Arc<Gauge<i64>>,
        pub(crate) completed_tasks: Arc<Counter>,
        pub(crate) failed_tasks: Arc<Counter>,
        pub(crate) postponed: Arc<Gauge<i64>>,
        pub(crate) backlog: Arc<Gauge<f64>>,
        pub(crate) normalized_backlog: Arc<Gauge<f64>>,
    }

    impl CompactionManagerStats {
        pub(crate) fn new(registry: &StatRegistry) -> Self {
            let stats = Self {
                active_tasks: Arc::new(Gauge::default()),
                pending_tasks: Arc::new(Gauge::default()),
                completed_tasks: Arc::new(Counter::default()),
                failed_tasks: Arc::new(Counter::default()),
                postponed: Arc::new(Gauge::default()),
                backlog: Arc::new(Gauge::default()),
                normalized_backlog: Arc::new(Gauge::default()),
            };
            registry.register(ACTIVE_COMPACTIONS, stats.active_tasks.clone());
            registry.register(PENDING_COMPACTIONS, stats.pending_tasks.clone());
            registry.register(COMPLETED_COMPACTIONS, stats.completed_tasks.clone());
            registry.register(FAILED_COMPACTIONS, stats.failed_tasks.clone());
            registry.register(POSTPONED_COMPACTIONS, stats.postponed.clone());
            registry.register(BACKLOG, stats.backlog.clone());
            registry.register(NORMALIZED_BACKLOG, stats.normalized_backlog.clone());
            stats
        }
    }
}
