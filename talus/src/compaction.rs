use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::sstable::{SsTableHandle, TokenRange};
use crate::table_state::TableHandle;

/// The kind of work a task performs. Also used to address tasks from the
/// operator-facing `stop_compaction` entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompactionType {
    Compaction,
    Cleanup,
    Scrub,
    Upgrade,
    Reshape,
    Reshard,
    Validation,
    IndexBuild,
}

impl Display for CompactionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompactionType::Compaction => "COMPACTION",
            CompactionType::Cleanup => "CLEANUP",
            CompactionType::Scrub => "SCRUB",
            CompactionType::Upgrade => "UPGRADE",
            CompactionType::Reshape => "RESHAPE",
            CompactionType::Reshard => "RESHARD",
            CompactionType::Validation => "VALIDATION",
            CompactionType::IndexBuild => "INDEX_BUILD",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CompactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPACTION" => Ok(CompactionType::Compaction),
            "CLEANUP" => Ok(CompactionType::Cleanup),
            "SCRUB" => Ok(CompactionType::Scrub),
            "UPGRADE" => Ok(CompactionType::Upgrade),
            "RESHAPE" => Ok(CompactionType::Reshape),
            "RESHARD" => Ok(CompactionType::Reshard),
            "VALIDATION" => Ok(CompactionType::Validation),
            "INDEX_BUILD" => Ok(CompactionType::IndexBuild),
            _ => Err(Error::InvalidArgument {
                msg: format!("unknown compaction type: {}", s),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrubMode {
    /// Stop the scrub at the first corruption.
    Abort,
    /// Skip corrupt rows, rewriting the rest.
    Skip,
    /// Segregate out-of-order data into new runs.
    Segregate,
    /// Read-only pass that reports corruption without rewriting.
    Validate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarantineMode {
    Include,
    Exclude,
    Only,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrubOptions {
    pub mode: ScrubMode,
    pub quarantine_mode: QuarantineMode,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        Self {
            mode: ScrubMode::Abort,
            quarantine_mode: QuarantineMode::Include,
        }
    }
}

/// Type-specific parameters of a descriptor.
#[derive(Clone, Debug)]
pub enum CompactionOptions {
    Regular,
    Cleanup { owned_ranges: Arc<Vec<TokenRange>> },
    Upgrade,
    Scrub { options: ScrubOptions },
    Reshape,
}

impl CompactionOptions {
    pub fn compaction_type(&self) -> CompactionType {
        match self {
            CompactionOptions::Regular => CompactionType::Compaction,
            CompactionOptions::Cleanup { .. } => CompactionType::Cleanup,
            CompactionOptions::Upgrade => CompactionType::Upgrade,
            CompactionOptions::Scrub { .. } => CompactionType::Scrub,
            CompactionOptions::Reshape => CompactionType::Reshape,
        }
    }
}

/// A unit of compaction work picked by a strategy: which sstables to merge
/// and how. The descriptor never includes files owned by another job.
#[derive(Clone, Debug)]
pub struct CompactionDescriptor {
    pub sstables: Vec<SsTableHandle>,
    pub options: CompactionOptions,
    /// Run identifier shared by the job's outputs; tracked manager-wide
    /// while the job runs so partial runs aren't picked by other jobs.
    pub run_identifier: Option<Uuid>,
    pub level: u32,
    pub has_only_fully_expired: bool,
    pub can_purge_tombstones: bool,
}

impl CompactionDescriptor {
    pub fn new(sstables: Vec<SsTableHandle>, options: CompactionOptions) -> Self {
        let has_only_fully_expired =
            !sstables.is_empty() && sstables.iter().all(|sst| sst.is_fully_expired());
        Self {
            sstables,
            options,
            run_identifier: None,
            level: 0,
            has_only_fully_expired,
            can_purge_tombstones: false,
        }
    }

    pub fn with_run_identifier(mut self, run_id: Uuid) -> Self {
        self.run_identifier = Some(run_id);
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sstables.is_empty()
    }

    pub fn sstables_size(&self) -> u64 {
        self.sstables.iter().map(|sst| sst.data_size()).sum()
    }

    /// Number of distinct input runs. Efficiency measure used by admission.
    pub fn fan_in(&self) -> u32 {
        self.sstables
            .iter()
            .map(|sst| sst.run_id())
            .collect::<HashSet<_>>()
            .len() as u32
    }
}

/// Replacement of sstables in a table set, observed by in-flight jobs of the
/// same table so their view of the set stays coherent mid-compaction.
#[derive(Clone, Debug)]
pub struct SsTableReplacement {
    pub removed: Vec<SsTableHandle>,
    pub added: Vec<SsTableHandle>,
}

/// Per-round execution state shared between a task and the engine's
/// compaction primitive: identity, cooperative cancellation, progress
/// counters and replacement notifications.
pub struct CompactionData {
    compaction_uuid: Uuid,
    fan_in: u32,
    abort: CancellationToken,
    stop_reason: Mutex<Option<String>>,
    pending_replacements: Mutex<Vec<SsTableReplacement>>,
    total_partitions: AtomicU64,
    total_keys_written: AtomicU64,
}

impl CompactionData {
    pub(crate) fn new(compaction_uuid: Uuid, fan_in: u32) -> Self {
        Self {
            compaction_uuid,
            fan_in,
            abort: CancellationToken::new(),
            stop_reason: Mutex::new(None),
            pending_replacements: Mutex::new(Vec::new()),
            total_partitions: AtomicU64::new(0),
            total_keys_written: AtomicU64::new(0),
        }
    }

    pub fn compaction_uuid(&self) -> Uuid {
        self.compaction_uuid
    }

    pub fn compaction_fan_in(&self) -> u32 {
        self.fan_in
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Request cooperative cancellation. The first reason wins.
    pub fn stop(&self, reason: impl Into<String>) {
        {
            let mut guard = self.stop_reason.lock();
            if guard.is_none() {
                guard.replace(reason.into());
            }
        }
        self.abort.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn stop_reason(&self) -> String {
        self.stop_reason.lock().clone().unwrap_or_default()
    }

    pub fn push_pending_replacement(&self, replacement: SsTableReplacement) {
        self.pending_replacements.lock().push(replacement);
    }

    pub fn take_pending_replacements(&self) -> Vec<SsTableReplacement> {
        std::mem::take(&mut self.pending_replacements.lock())
    }

    /// Progress reporting hooks for the engine's compaction primitive.
    pub fn add_partitions_processed(&self, n: u64) {
        self.total_partitions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_keys_written(&self, n: u64) {
        self.total_keys_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_partitions(&self) -> u64 {
        self.total_partitions.load(Ordering::Relaxed)
    }

    pub fn total_keys_written(&self) -> u64 {
        self.total_keys_written.load(Ordering::Relaxed)
    }
}

/// Sstables removed and added by a finished (or finishing) compaction.
#[derive(Clone, Debug, Default)]
pub struct CompactionCompletionDesc {
    pub old_sstables: Vec<SsTableHandle>,
    pub new_sstables: Vec<SsTableHandle>,
}

/// Outcome of one `compact_sstables` invocation.
#[derive(Clone, Debug)]
pub struct CompactionResult {
    pub new_sstables: Vec<SsTableHandle>,
    pub ended_at: DateTime<Utc>,
    pub start_size: u64,
    pub end_size: u64,
}

/// Operator-facing snapshot of a running job.
#[derive(Clone, Debug)]
pub struct CompactionInfo {
    pub compaction_uuid: Uuid,
    pub compaction_type: CompactionType,
    pub ks_name: String,
    pub cf_name: String,
    pub total_partitions: u64,
    pub total_keys_written: u64,
}

/// Callback the engine's primitive invokes when a batch of inputs has been
/// fully consumed and its outputs sealed, so table sets can be updated while
/// the job keeps running.
#[async_trait]
pub trait SstableReplacer: Send + Sync {
    async fn replace(&self, desc: CompactionCompletionDesc) -> Result<(), Error>;
}

/// The external primitive that actually merges files. Supplied by the
/// storage engine; everything the manager schedules funnels through it.
///
/// Implementations must observe `data`'s abort token at their own blocking
/// points and fail with [`Error::Stopped`] when it fires.
#[async_trait]
pub trait CompactionExecutor: Send + Sync {
    async fn compact_sstables(
        &self,
        descriptor: CompactionDescriptor,
        data: Arc<CompactionData>,
        table: &TableHandle,
        replacer: Option<Arc<dyn SstableReplacer>>,
    ) -> Result<CompactionResult, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{SsTable, SsTableId};
    use crate::utils::IdGenerator;

    #[test]
    fn test_compaction_type_parsing() {
        assert_eq!(
            "compaction".parse::<CompactionType>().unwrap(),
            CompactionType::Compaction
        );
        assert_eq!(
            "Index_build".parse::<CompactionType>().unwrap(),
            CompactionType::IndexBuild
        );
        assert!("unknown".parse::<CompactionType>().is_err());
    }

    #[test]
    fn test_fan_in_counts_distinct_runs() {
        let mut rng = rand::rng();
        let run_a = rng.gen_uuid();
        let run_b = rng.gen_uuid();
        let ssts = vec![
            Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), run_a, 1)),
            Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), run_a, 1)),
            Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), run_b, 1)),
        ];
        let desc = CompactionDescriptor::new(ssts, CompactionOptions::Regular);
        assert_eq!(desc.fan_in(), 2);
    }

    #[test]
    fn test_descriptor_fully_expired_flag() {
        let mut rng = rand::rng();
        let expired = Arc::new(
            SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), 1).with_fully_expired(true),
        );
        let live = Arc::new(SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), 1));

        let desc = CompactionDescriptor::new(vec![expired.clone()], CompactionOptions::Regular);
        assert!(desc.has_only_fully_expired);
        let desc = CompactionDescriptor::new(vec![expired, live], CompactionOptions::Regular);
        assert!(!desc.has_only_fully_expired);
        let desc = CompactionDescriptor::new(vec![], CompactionOptions::Regular);
        assert!(!desc.has_only_fully_expired);
    }

    #[test]
    fn test_compaction_data_stop_keeps_first_reason() {
        let data = CompactionData::new(rand::rng().gen_uuid(), 1);
        assert!(!data.is_stop_requested());
        data.stop("user request");
        data.stop("shutdown");
        assert!(data.is_stop_requested());
        assert_eq!(data.stop_reason(), "user request");
    }
}
