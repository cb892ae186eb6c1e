use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::compaction::CompactionCompletionDesc;
use crate::error::Error;
use crate::sstable::SsTableHandle;
use crate::strategy::CompactionStrategy;

/// Identity of the schema a table serves.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Schema {
    pub ks_name: String,
    pub cf_name: String,
    /// Upper bound on inputs a single compaction of this table should take.
    pub max_compaction_threshold: usize,
}

impl Schema {
    pub fn new(ks_name: impl Into<String>, cf_name: impl Into<String>) -> Self {
        Self {
            ks_name: ks_name.into(),
            cf_name: cf_name.into(),
            max_compaction_threshold: 32,
        }
    }

    pub fn with_max_compaction_threshold(mut self, threshold: usize) -> Self {
        self.max_compaction_threshold = threshold;
        self
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.ks_name, self.cf_name)
    }
}

/// The surface a table exposes to the compaction manager. Implemented by the
/// embedding engine; the manager only holds address-stable `Arc` handles and
/// never assumes anything about the sets beyond what this trait returns.
#[async_trait]
pub trait TableState: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Snapshot of the main sstable set.
    fn main_sstables(&self) -> Vec<SsTableHandle>;

    /// Snapshot of the maintenance (off-strategy) sstable set.
    fn maintenance_sstables(&self) -> Vec<SsTableHandle>;

    fn get_compaction_strategy(&self) -> Arc<dyn CompactionStrategy>;

    /// Allocate a fresh output sstable for a compaction of this table.
    fn make_sstable(&self) -> SsTableHandle;

    /// Apply a completed compaction to the table's sets. With
    /// `offstrategy = true` the new sstables replace the maintenance set's
    /// candidates in the main set in a single transaction.
    async fn on_compaction_completion(
        &self,
        desc: CompactionCompletionDesc,
        offstrategy: bool,
    ) -> Result<(), Error>;

    /// Record a finished compaction in the engine's history table.
    async fn update_compaction_history(
        &self,
        compaction_uuid: Uuid,
        ended_at: DateTime<Utc>,
        start_size: u64,
        end_size: u64,
    ) -> Result<(), Error>;

    fn is_auto_compaction_disabled_by_user(&self) -> bool;

    /// Highest sstable format version the engine can write; used by upgrade
    /// to decide which files are stale.
    fn highest_supported_format(&self) -> u32 {
        1
    }
}

pub type TableHandle = Arc<dyn TableState>;

/// Address-stable key for a registered table. Two handles compare equal iff
/// they point at the same `TableState` allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TableKey(usize);

pub(crate) fn table_key(t: &TableHandle) -> TableKey {
    TableKey(Arc::as_ptr(t) as *const () as usize)
}

/// All main-set sstables that the strategy may consider, i.e. everything not
/// already slated for removal.
pub fn in_strategy_sstables(t: &TableHandle) -> Vec<SsTableHandle> {
    t.main_sstables()
        .into_iter()
        .filter(|sst| sst.is_eligible_for_compaction())
        .collect()
}
