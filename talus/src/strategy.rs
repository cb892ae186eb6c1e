use crate::compaction::CompactionDescriptor;
use crate::sstable::SsTableHandle;
use crate::table_state::TableHandle;

/// How strictly a reshape round must restore the strategy invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReshapeMode {
    /// Every violation must be repaired before integration.
    Strict,
    /// Best effort; used when reshaping under space pressure.
    Relaxed,
}

/// Query surface handed to strategies so they can see manager state without
/// reaching into it.
pub trait StrategyControl: Send + Sync {
    /// True if the manager is running a compaction on behalf of a table with
    /// the same schema identity.
    fn has_ongoing_compaction(&self, table: &TableHandle) -> bool;
}

/// Policy plug-in that picks candidate files for each job flavor. The
/// manager owns scheduling and admission; strategies only decide *what* to
/// compact.
///
/// `candidates` passed to the pickers are pre-filtered: files owned by
/// another job, or belonging to an output run still being generated, are
/// never offered.
pub trait CompactionStrategy: Send + Sync {
    /// Pick the next regular compaction for the table, or an empty
    /// descriptor if there is nothing worth doing.
    fn get_sstables_for_compaction(
        &self,
        table: &TableHandle,
        control: &dyn StrategyControl,
        candidates: Vec<SsTableHandle>,
    ) -> CompactionDescriptor;

    /// Descriptor subsuming all eligible files of the table.
    fn get_major_compaction_job(
        &self,
        table: &TableHandle,
        candidates: Vec<SsTableHandle>,
    ) -> CompactionDescriptor;

    /// One round of maintenance-set repair. An empty descriptor ends the
    /// reshape loop.
    fn get_reshaping_job(
        &self,
        candidates: Vec<SsTableHandle>,
        mode: ReshapeMode,
    ) -> CompactionDescriptor;

    /// Split cleanup candidates into independently-runnable jobs.
    fn get_cleanup_compaction_jobs(
        &self,
        table: &TableHandle,
        candidates: Vec<SsTableHandle>,
    ) -> Vec<CompactionDescriptor>;

    /// Whether this strategy tolerates more than one concurrent compaction
    /// on the same table.
    fn parallel_compaction(&self) -> bool {
        true
    }

    /// Observe a mid-job replacement of inputs with outputs.
    fn notify_completion(&self, _removed: &[SsTableHandle], _added: &[SsTableHandle]) {}
}
