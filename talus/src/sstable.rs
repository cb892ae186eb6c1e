use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ulid::Ulid;
use uuid::Uuid;

/// Identifier of an sstable. Stable for the lifetime of the file, including
/// across compaction-set updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SsTableId(pub Ulid);

impl Display for SsTableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata handle for an immutable on-disk table. The compaction manager
/// never reads table contents; it tracks identity, sizing and lifecycle
/// flags, and leaves the bytes to the engine's `compact_sstables` primitive.
pub struct SsTable {
    id: SsTableId,
    /// Run this sstable belongs to. All outputs of one compaction descriptor
    /// share a run identifier.
    run_id: Uuid,
    size: u64,
    level: u32,
    format_version: u32,
    first_token: i64,
    last_token: i64,
    quarantined: bool,
    requires_view_building: bool,
    /// True when every row in this sstable is past its expiry. Descriptors
    /// made solely of such tables are weightless (see admission rules).
    fully_expired: bool,
    marked_for_deletion: AtomicBool,
    unlinked: AtomicBool,
}

pub type SsTableHandle = Arc<SsTable>;

impl SsTable {
    pub fn new(id: SsTableId, run_id: Uuid, size: u64) -> Self {
        Self {
            id,
            run_id,
            size,
            level: 0,
            format_version: 1,
            first_token: i64::MIN,
            last_token: i64::MAX,
            quarantined: false,
            requires_view_building: false,
            fully_expired: false,
            marked_for_deletion: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }

    pub fn with_token_range(mut self, first: i64, last: i64) -> Self {
        self.first_token = first;
        self.last_token = last;
        self
    }

    pub fn with_quarantined(mut self, quarantined: bool) -> Self {
        self.quarantined = quarantined;
        self
    }

    pub fn with_requires_view_building(mut self, requires: bool) -> Self {
        self.requires_view_building = requires;
        self
    }

    pub fn with_fully_expired(mut self, expired: bool) -> Self {
        self.fully_expired = expired;
        self
    }

    pub fn id(&self) -> SsTableId {
        self.id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn data_size(&self) -> u64 {
        self.size
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn token_range(&self) -> TokenRange {
        TokenRange {
            first: self.first_token,
            last: self.last_token,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn requires_view_building(&self) -> bool {
        self.requires_view_building
    }

    pub fn is_fully_expired(&self) -> bool {
        self.fully_expired
    }

    /// Defer removal of the file to the engine's next set update. Inputs
    /// originating in a maintenance set are removed this way so view
    /// building can resume from the staging directory after a crash.
    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    /// Immediately release the file. Used for intermediates that no later
    /// reshape round will read.
    pub fn unlink(&self) {
        self.unlinked.store(true, Ordering::SeqCst);
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    pub fn is_eligible_for_compaction(&self) -> bool {
        !self.is_marked_for_deletion() && !self.is_unlinked()
    }
}

impl PartialEq for SsTable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SsTable {}

impl Hash for SsTable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("size", &self.size)
            .field("level", &self.level)
            .finish()
    }
}

/// Inclusive token range covered by an sstable or owned by this replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRange {
    pub first: i64,
    pub last: i64,
}

impl TokenRange {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, other: &TokenRange) -> bool {
        self.first <= other.first && other.last <= self.last
    }

    fn is_before(&self, token: i64) -> bool {
        self.last < token
    }
}

/// Returns true iff the sstable's token range isn't fully contained in any
/// of the sorted owned ranges, i.e. the file still carries keys this replica
/// no longer owns.
pub fn needs_cleanup(sst: &SsTable, sorted_owned_ranges: &[TokenRange]) -> bool {
    let sst_range = sst.token_range();
    let idx = sorted_owned_ranges.partition_point(|r| r.is_before(sst_range.first));
    if let Some(r) = sorted_owned_ranges.get(idx) {
        if r.contains(&sst_range) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::IdGenerator;

    fn sst_with_tokens(first: i64, last: i64) -> SsTable {
        let mut rng = rand::rng();
        SsTable::new(SsTableId(rng.gen_ulid()), rng.gen_uuid(), 1024).with_token_range(first, last)
    }

    #[test]
    fn test_needs_cleanup_contained_range() {
        let ranges = vec![TokenRange::new(0, 100), TokenRange::new(200, 300)];
        assert!(!needs_cleanup(&sst_with_tokens(10, 90), &ranges));
        assert!(!needs_cleanup(&sst_with_tokens(200, 300), &ranges));
    }

    #[test]
    fn test_needs_cleanup_partial_overlap() {
        let ranges = vec![TokenRange::new(0, 100), TokenRange::new(200, 300)];
        assert!(needs_cleanup(&sst_with_tokens(50, 250), &ranges));
        assert!(needs_cleanup(&sst_with_tokens(150, 180), &ranges));
    }

    #[test]
    fn test_eligibility_flags() {
        let sst = sst_with_tokens(0, 1);
        assert!(sst.is_eligible_for_compaction());
        sst.mark_for_deletion();
        assert!(!sst.is_eligible_for_compaction());

        let sst = sst_with_tokens(0, 1);
        sst.unlink();
        assert!(!sst.is_eligible_for_compaction());
    }
}
