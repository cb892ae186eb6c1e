use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use ulid::Ulid;
use uuid::Uuid;

use crate::compaction::{
    CompactionCompletionDesc, CompactionData, CompactionDescriptor, CompactionResult,
    CompactionType, SstableReplacer,
};
use crate::error::Error;
use crate::manager::{CompactionState, ManagerInner};
use crate::registration::CompactingRegistration;
use crate::stats::ReadableStat;
use crate::table_state::{table_key, TableHandle, TableKey};
use crate::utils::{ExponentialBackoffRetry, IdGenerator, WatchableOnceCell, WatchableOnceCellReader};

/// Lifecycle of a compaction task.
///
/// `Pending` and `Active` may alternate across rounds; `Done`, `Postponed`
/// and `Failed` only transition back to `None`, the initial and terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    None,
    Pending,
    Active,
    Postponed,
    Done,
    Failed,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::None => "none",
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Postponed => "postponed",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Whether a failed round should be re-attempted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    Retry,
    Finished,
}

/// Shared base of every task flavor: identity, state machine bookkeeping,
/// per-round compaction data, retry backoff and completion signaling.
pub(crate) struct Task {
    id: Ulid,
    kind: CompactionType,
    description: String,
    table: TableHandle,
    key: TableKey,
    mgr: Arc<ManagerInner>,
    cstate: Arc<CompactionState>,
    state: Mutex<TaskState>,
    output_run_id: Mutex<Option<Uuid>>,
    data: Mutex<Arc<CompactionData>>,
    retry: Mutex<ExponentialBackoffRetry>,
    done: WatchableOnceCell<Result<(), Error>>,
    // keeps the table's gate held for the task's whole lifetime
    _gate: crate::utils::GateHolder,
}

impl Task {
    pub(crate) fn new(
        mgr: Arc<ManagerInner>,
        table: TableHandle,
        kind: CompactionType,
        description: impl Into<String>,
    ) -> Result<Arc<Self>, Error> {
        let key = table_key(&table);
        let cstate = mgr
            .compaction_state(key)
            .ok_or_else(|| Error::TableNotFound {
                table: table.schema().to_string(),
            })?;
        let gate = cstate.gate.hold().ok_or_else(|| Error::GateClosed {
            table: table.schema().to_string(),
        })?;
        let (retry_base, retry_max) = {
            let options = mgr.options();
            (options.retry_initial_backoff, options.retry_max_backoff)
        };
        let mut rng = rand::rng();
        Ok(Arc::new(Self {
            id: rng.gen_ulid(),
            kind,
            description: description.into(),
            table,
            key,
            cstate,
            state: Mutex::new(TaskState::None),
            output_run_id: Mutex::new(None),
            data: Mutex::new(Arc::new(CompactionData::new(rng.gen_uuid(), 0))),
            retry: Mutex::new(ExponentialBackoffRetry::new(retry_base, retry_max)),
            done: WatchableOnceCell::new(),
            _gate: gate,
            mgr,
        }))
    }

    pub(crate) fn id(&self) -> Ulid {
        self.id
    }

    pub(crate) fn kind(&self) -> CompactionType {
        self.kind
    }

    pub(crate) fn table(&self) -> &TableHandle {
        &self.table
    }

    pub(crate) fn manager(&self) -> &Arc<ManagerInner> {
        &self.mgr
    }

    pub(crate) fn table_key(&self) -> TableKey {
        self.key
    }

    pub(crate) fn compaction_state(&self) -> &Arc<CompactionState> {
        &self.cstate
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn compaction_running(&self) -> bool {
        self.state() == TaskState::Active
    }

    pub(crate) fn generating_output_run(&self) -> bool {
        self.compaction_running() && self.output_run_id.lock().is_some()
    }

    pub(crate) fn output_run_id(&self) -> Option<Uuid> {
        *self.output_run_id.lock()
    }

    pub(crate) fn data(&self) -> Arc<CompactionData> {
        self.data.lock().clone()
    }

    pub(crate) fn stopping(&self) -> bool {
        self.data().is_stop_requested()
    }

    /// Request cooperative cancellation of the current round.
    pub(crate) fn stop(&self, reason: impl Into<String>) {
        self.data().stop(reason);
    }

    pub(crate) fn make_stopped_error(&self) -> Error {
        Error::Stopped {
            table: self.table.schema().to_string(),
            reason: self.data().stop_reason(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "{} task {} for table {}",
            self.description,
            self.id,
            self.table.schema()
        )
    }

    pub(crate) fn completion_reader(&self) -> WatchableOnceCellReader<Result<(), Error>> {
        self.done.reader()
    }

    pub(crate) fn complete(&self, result: Result<(), Error>) {
        self.done.write(result);
    }

    /// Move the task to a new state, keeping the manager-wide counters in
    /// sync. Returns the previous state.
    pub(crate) fn switch_state(&self, new_state: TaskState) -> TaskState {
        let old_state = {
            let mut guard = self.state.lock();
            std::mem::replace(&mut *guard, new_state)
        };
        let stats = self.mgr.stats();
        match old_state {
            TaskState::Pending => {
                stats.pending_tasks.dec();
            }
            TaskState::Active => {
                stats.active_tasks.dec();
            }
            TaskState::None | TaskState::Done | TaskState::Postponed | TaskState::Failed => {}
        }
        match new_state {
            TaskState::Pending => {
                stats.pending_tasks.inc();
            }
            TaskState::Active => {
                stats.active_tasks.inc();
            }
            TaskState::Done => {
                stats.completed_tasks.inc();
            }
            TaskState::None | TaskState::Postponed | TaskState::Failed => {}
        }
        debug!(
            "{}: switch_state: {} -> {}: pending={} active={} done={} errors={}",
            self.describe(),
            old_state,
            new_state,
            stats.pending_tasks.value(),
            stats.active_tasks.value(),
            stats.completed_tasks.get(),
            stats.failed_tasks.get(),
        );
        old_state
    }

    /// True if the task isn't stopped and the manager allows proceeding on
    /// this table.
    pub(crate) fn can_proceed(&self) -> bool {
        !self.stopping() && self.mgr.can_proceed_for(self.key)
    }

    /// Like [`Task::can_proceed`], but surfaces a stop request as an error
    /// so callers waiting for a chance to run (e.g. reshape) learn why they
    /// never got one.
    pub(crate) fn can_proceed_or_throw(&self) -> Result<bool, Error> {
        if self.stopping() {
            return Err(self.make_stopped_error());
        }
        Ok(self.mgr.can_proceed_for(self.key))
    }

    /// Acquire a unit from a semaphore, observing the abort token. A stop
    /// while queued converts to [`Error::Stopped`].
    pub(crate) async fn acquire_semaphore(
        &self,
        sem: &Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, Error> {
        let abort = self.data();
        tokio::select! {
            biased;
            _ = abort.abort_token().cancelled() => Err(self.make_stopped_error()),
            permit = sem.clone().acquire_owned() => {
                permit.map_err(|_| Error::Shutdown)
            }
        }
    }

    /// Start a new compaction round: fresh `CompactionData`, the output run
    /// id the round will generate (if any), state `Active`.
    pub(crate) fn setup_new_compaction(&self, output_run_id: Option<Uuid>, fan_in: u32) {
        let mut rng = rand::rng();
        *self.data.lock() = Arc::new(CompactionData::new(rng.gen_uuid(), fan_in));
        *self.output_run_id.lock() = output_run_id;
        self.switch_state(TaskState::Active);
    }

    /// End the current round. Non-failed finishes reset the retry backoff.
    /// Always signals the table's completion condvar.
    pub(crate) fn finish_compaction(&self, finish_state: TaskState) {
        self.switch_state(finish_state);
        *self.output_run_id.lock() = None;
        if finish_state != TaskState::Failed {
            self.retry.lock().reset();
        }
        self.cstate.compaction_done.signal_all();
    }

    /// Classify a round failure.
    ///
    /// Stop requests end the task quietly. Aborts and storage errors are
    /// rethrown after bumping the error counter, a storage error also taking
    /// the whole manager down. Anything else backs off exponentially and
    /// retries, as long as the task may still proceed.
    pub(crate) async fn maybe_retry(&self, err: Error) -> Result<RetryOutcome, Error> {
        match err {
            e @ Error::Stopped { .. } => {
                info!("{}: {}: stopping", self.describe(), e);
                Ok(RetryOutcome::Finished)
            }
            e @ Error::Aborted { .. } => {
                error!("{}: {}: stopping", self.describe(), e);
                self.mgr.stats().failed_tasks.inc();
                Err(e)
            }
            e @ Error::StorageIo(_) => {
                error!(
                    "{}: failed due to storage I/O error: {}: stopping",
                    self.describe(),
                    e
                );
                self.mgr.stats().failed_tasks.inc();
                self.mgr.do_stop();
                Err(e)
            }
            e => {
                if self.can_proceed() {
                    self.mgr.stats().failed_tasks.inc();
                    let sleep_time = self.retry.lock().next_sleep();
                    error!(
                        "{}: failed: {}. Will retry in {} seconds",
                        self.describe(),
                        e,
                        sleep_time.as_secs()
                    );
                    self.switch_state(TaskState::Pending);
                    let abort = self.data();
                    let slept = tokio::select! {
                        biased;
                        _ = abort.abort_token().cancelled() => false,
                        _ = tokio::time::sleep(sleep_time) => true,
                    };
                    if !slept {
                        return Err(self.make_stopped_error());
                    }
                    Ok(RetryOutcome::Retry)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Run the engine's compaction primitive for a descriptor, wiring up the
    /// mid-flight replacer so exhausted inputs leave the table set (and the
    /// compacting registry) while the job is still running.
    pub(crate) async fn compact_sstables(
        &self,
        mut descriptor: CompactionDescriptor,
        compacting: Arc<CompactingRegistration>,
        can_purge: bool,
    ) -> Result<CompactionResult, Error> {
        descriptor.can_purge_tombstones = can_purge;
        let replacer: Arc<dyn SstableReplacer> = Arc::new(TaskReplacer {
            mgr: self.mgr.clone(),
            table: self.table.clone(),
            compacting,
        });
        self.mgr
            .executor()
            .compact_sstables(descriptor, self.data(), &self.table, Some(replacer))
            .await
    }

    /// [`Task::compact_sstables`] followed by a history record for regular
    /// compactions. No-op for empty descriptors.
    pub(crate) async fn compact_sstables_and_update_history(
        &self,
        descriptor: CompactionDescriptor,
        compacting: Arc<CompactingRegistration>,
        can_purge: bool,
    ) -> Result<(), Error> {
        if descriptor.sstables.is_empty() {
            return Ok(());
        }
        let should_update_history = should_update_history(descriptor.options.compaction_type());
        let res = self
            .compact_sstables(descriptor, compacting, can_purge)
            .await?;
        if should_update_history {
            self.update_history(&res).await?;
        }
        Ok(())
    }

    pub(crate) async fn update_history(&self, res: &CompactionResult) -> Result<(), Error> {
        let data = self.data();
        self.table
            .update_compaction_history(
                data.compaction_uuid(),
                res.ended_at,
                res.start_size,
                res.end_size,
            )
            .await
    }
}

pub(crate) fn should_update_history(compaction_type: CompactionType) -> bool {
    compaction_type == CompactionType::Compaction
}

impl Drop for Task {
    fn drop(&mut self) {
        self.switch_state(TaskState::None);
    }
}

/// Applies a mid-job replacement: the strategy hears about it first, then
/// other running jobs of the table, then the table set itself; finally the
/// exhausted inputs are released from the compacting registry so their disk
/// space can be reclaimed.
struct TaskReplacer {
    mgr: Arc<ManagerInner>,
    table: TableHandle,
    compacting: Arc<CompactingRegistration>,
}

#[async_trait]
impl SstableReplacer for TaskReplacer {
    async fn replace(&self, desc: CompactionCompletionDesc) -> Result<(), Error> {
        let strategy = self.table.get_compaction_strategy();
        strategy.notify_completion(&desc.old_sstables, &desc.new_sstables);
        self.mgr
            .propagate_replacement(&self.table, &desc.old_sstables, &desc.new_sstables);
        let old_sstables = desc.old_sstables.clone();
        self.table.on_compaction_completion(desc, false).await?;
        self.compacting.release(&old_sstables);
        Ok(())
    }
}
