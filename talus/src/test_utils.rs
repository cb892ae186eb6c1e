//! Test doubles for the compaction manager: an in-memory table, a scripted
//! strategy, and a controllable executor that can hang, fail, or complete
//! compactions on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::DefaultSystemClock;
use crate::compaction::{
    CompactionCompletionDesc, CompactionData, CompactionDescriptor, CompactionExecutor,
    CompactionOptions, CompactionResult, SstableReplacer,
};
use crate::config::CompactionManagerConfig;
use crate::error::Error;
use crate::manager::CompactionManager;
use crate::sstable::{SsTable, SsTableHandle, SsTableId};
use crate::stats::StatRegistry;
use crate::strategy::{CompactionStrategy, ReshapeMode, StrategyControl};
use crate::table_state::{Schema, TableHandle, TableState};
use crate::utils::IdGenerator;

pub(crate) fn make_sstable(size: u64) -> SsTableHandle {
    let mut rng = rand::rng();
    Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), size))
}

pub(crate) fn make_expired_sstable(size: u64) -> SsTableHandle {
    let mut rng = rand::rng();
    Arc::new(
        SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), size).with_fully_expired(true),
    )
}

/// In-memory `TableState` with mutable main/maintenance sets.
pub(crate) struct TestTable {
    schema: Schema,
    main: Mutex<Vec<SsTableHandle>>,
    maintenance: Mutex<Vec<SsTableHandle>>,
    strategy: Arc<TestStrategy>,
    auto_compaction_disabled: AtomicBool,
    history_updates: AtomicU64,
    created: Mutex<Vec<SsTableHandle>>,
}

impl TestTable {
    pub(crate) fn new(name: &str, strategy: Arc<TestStrategy>) -> Arc<Self> {
        Arc::new(Self {
            schema: Schema::new("ks", name),
            main: Mutex::new(Vec::new()),
            maintenance: Mutex::new(Vec::new()),
            strategy,
            auto_compaction_disabled: AtomicBool::new(false),
            history_updates: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn handle(self: &Arc<Self>) -> TableHandle {
        self.clone()
    }

    pub(crate) fn add_sstables(&self, ssts: Vec<SsTableHandle>) {
        self.main.lock().extend(ssts);
    }

    pub(crate) fn add_maintenance_sstables(&self, ssts: Vec<SsTableHandle>) {
        self.maintenance.lock().extend(ssts);
    }

    pub(crate) fn set_auto_compaction_disabled(&self, disabled: bool) {
        self.auto_compaction_disabled
            .store(disabled, Ordering::SeqCst);
    }

    pub(crate) fn history_updates(&self) -> u64 {
        self.history_updates.load(Ordering::SeqCst)
    }

    /// Output sstables handed out by `make_sstable`, in creation order.
    pub(crate) fn created_sstables(&self) -> Vec<SsTableHandle> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TableState for TestTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn main_sstables(&self) -> Vec<SsTableHandle> {
        self.main.lock().clone()
    }

    fn maintenance_sstables(&self) -> Vec<SsTableHandle> {
        self.maintenance.lock().clone()
    }

    fn get_compaction_strategy(&self) -> Arc<dyn CompactionStrategy> {
        self.strategy.clone()
    }

    fn make_sstable(&self) -> SsTableHandle {
        let sst = make_sstable(1024);
        self.created.lock().push(sst.clone());
        sst
    }

    async fn on_compaction_completion(
        &self,
        desc: CompactionCompletionDesc,
        offstrategy: bool,
    ) -> Result<(), Error> {
        if offstrategy {
            let mut maintenance = self.maintenance.lock();
            maintenance.retain(|sst| !desc.old_sstables.contains(sst));
            self.main.lock().extend(desc.new_sstables);
        } else {
            let mut main = self.main.lock();
            main.retain(|sst| !desc.old_sstables.contains(sst));
            main.extend(desc.new_sstables);
        }
        Ok(())
    }

    async fn update_compaction_history(
        &self,
        _compaction_uuid: Uuid,
        _ended_at: chrono::DateTime<Utc>,
        _start_size: u64,
        _end_size: u64,
    ) -> Result<(), Error> {
        self.history_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_auto_compaction_disabled_by_user(&self) -> bool {
        self.auto_compaction_disabled.load(Ordering::SeqCst)
    }

    fn highest_supported_format(&self) -> u32 {
        2
    }
}

/// Strategy double: regular compaction merges all candidates once at least
/// `min_sources` are present; reshape rounds follow a script of "take N"
/// steps; cleanup emits one job per candidate.
pub(crate) struct TestStrategy {
    min_sources: usize,
    parallel: bool,
    reshape_script: Mutex<VecDeque<usize>>,
}

impl TestStrategy {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_min_sources(2)
    }

    pub(crate) fn with_min_sources(min_sources: usize) -> Arc<Self> {
        Arc::new(Self {
            min_sources,
            parallel: true,
            reshape_script: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn serial() -> Arc<Self> {
        Arc::new(Self {
            min_sources: 2,
            parallel: false,
            reshape_script: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn script_reshape_rounds(&self, takes: impl IntoIterator<Item = usize>) {
        self.reshape_script.lock().extend(takes);
    }

    fn descriptor_over(ssts: Vec<SsTableHandle>) -> CompactionDescriptor {
        let mut rng = rand::rng();
        CompactionDescriptor::new(ssts, CompactionOptions::Regular)
            .with_run_identifier(rng.gen_uuid())
    }
}

impl CompactionStrategy for TestStrategy {
    fn get_sstables_for_compaction(
        &self,
        _table: &TableHandle,
        _control: &dyn StrategyControl,
        candidates: Vec<SsTableHandle>,
    ) -> CompactionDescriptor {
        if candidates.len() < self.min_sources {
            return CompactionDescriptor::new(Vec::new(), CompactionOptions::Regular);
        }
        Self::descriptor_over(candidates)
    }

    fn get_major_compaction_job(
        &self,
        _table: &TableHandle,
        candidates: Vec<SsTableHandle>,
    ) -> CompactionDescriptor {
        Self::descriptor_over(candidates)
    }

    fn get_reshaping_job(
        &self,
        candidates: Vec<SsTableHandle>,
        _mode: ReshapeMode,
    ) -> CompactionDescriptor {
        let take = self.reshape_script.lock().pop_front().unwrap_or(0);
        let take = take.min(candidates.len());
        if take == 0 {
            return CompactionDescriptor::new(Vec::new(), CompactionOptions::Reshape);
        }
        let mut rng = rand::rng();
        CompactionDescriptor::new(
            candidates.into_iter().take(take).collect(),
            CompactionOptions::Reshape,
        )
        .with_run_identifier(rng.gen_uuid())
    }

    fn get_cleanup_compaction_jobs(
        &self,
        _table: &TableHandle,
        candidates: Vec<SsTableHandle>,
    ) -> Vec<CompactionDescriptor> {
        candidates
            .into_iter()
            .map(|sst| {
                let mut rng = rand::rng();
                CompactionDescriptor::new(vec![sst], CompactionOptions::Regular)
                    .with_run_identifier(rng.gen_uuid())
            })
            .collect()
    }

    fn parallel_compaction(&self) -> bool {
        self.parallel
    }
}

/// Executor double. By default every compaction parks until the test hands
/// out a release permit (or the job is aborted); `auto_release` turns it
/// into an immediate-success executor. Failures can be queued up front.
pub(crate) struct TestExecutor {
    auto_release: AtomicBool,
    release: Arc<Semaphore>,
    fail_next: Mutex<VecDeque<Error>>,
    started: Mutex<Vec<CompactionDescriptor>>,
    completed: Mutex<Vec<CompactionDescriptor>>,
}

impl TestExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_release: AtomicBool::new(false),
            release: Arc::new(Semaphore::new(0)),
            fail_next: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn auto_releasing() -> Arc<Self> {
        let executor = Self::new();
        executor.auto_release.store(true, Ordering::SeqCst);
        executor
    }

    /// Let `n` parked compactions finish.
    pub(crate) fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    pub(crate) fn fail_next_with(&self, err: Error) {
        self.fail_next.lock().push_back(err);
    }

    pub(crate) fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub(crate) fn completed_descriptors(&self) -> Vec<CompactionDescriptor> {
        self.completed.lock().clone()
    }
}

#[async_trait]
impl CompactionExecutor for TestExecutor {
    async fn compact_sstables(
        &self,
        descriptor: CompactionDescriptor,
        data: Arc<CompactionData>,
        table: &TableHandle,
        replacer: Option<Arc<dyn SstableReplacer>>,
    ) -> Result<CompactionResult, Error> {
        self.started.lock().push(descriptor.clone());
        let stopped = || Error::Stopped {
            table: table.schema().to_string(),
            reason: data.stop_reason(),
        };
        if self.auto_release.load(Ordering::SeqCst) {
            if data.is_stop_requested() {
                return Err(stopped());
            }
        } else {
            tokio::select! {
                biased;
                _ = data.abort_token().cancelled() => return Err(stopped()),
                permit = self.release.clone().acquire_owned() => {
                    match permit {
                        Ok(p) => p.forget(),
                        Err(_) => return Err(Error::Shutdown),
                    }
                }
            }
        }
        if let Some(err) = self.fail_next.lock().pop_front() {
            return Err(err);
        }

        let start_size = descriptor.sstables_size();
        let output = table.make_sstable();
        if let Some(replacer) = replacer {
            replacer
                .replace(CompactionCompletionDesc {
                    old_sstables: descriptor.sstables.clone(),
                    new_sstables: vec![output.clone()],
                })
                .await?;
        }
        data.add_partitions_processed(descriptor.sstables.len() as u64);
        data.add_keys_written(descriptor.sstables.len() as u64);
        self.completed.lock().push(descriptor);
        Ok(CompactionResult {
            new_sstables: vec![output.clone()],
            ended_at: Utc::now(),
            start_size,
            end_size: output.data_size(),
        })
    }
}

pub(crate) fn test_manager(executor: Arc<TestExecutor>) -> (CompactionManager, Arc<StatRegistry>) {
    let registry = Arc::new(StatRegistry::new());
    let manager = CompactionManager::new(
        CompactionManagerConfig::default(),
        executor,
        &registry,
        Arc::new(DefaultSystemClock::new()),
        CancellationToken::new(),
    );
    (manager, registry)
}

/// Poll `cond` until it holds, panicking after a 10 second deadline.
pub(crate) async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
