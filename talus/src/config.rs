use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::controller::SchedulingGroup;

/// Tuning knobs of the compaction manager.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompactionManagerOptions {
    /// All registered tables are resubmitted for regular compaction at this
    /// interval. Submission is a no-op when there is nothing to do, so the
    /// sweep is cheap.
    pub periodic_submission_interval: Duration,

    /// First retry delay after a transient task failure.
    pub retry_initial_backoff: Duration,

    /// Upper bound the retry delay doubles toward.
    pub retry_max_backoff: Duration,
}

impl Default for CompactionManagerOptions {
    fn default() -> Self {
        Self {
            periodic_submission_interval: Duration::from_secs(3600),
            retry_initial_backoff: Duration::from_secs(5),
            retry_max_backoff: Duration::from_secs(300),
        }
    }
}

/// Wiring between the manager and the embedding engine: execution groups,
/// memory budget for backlog normalization, and runtime-updateable settings
/// delivered over watch channels.
pub struct CompactionManagerConfig {
    /// Group regular compactions run under.
    pub compaction_group: SchedulingGroup,

    /// Group maintenance jobs (major, cleanup, scrub, upgrade, reshape) run
    /// under.
    pub maintenance_group: SchedulingGroup,

    /// Shard memory budget; backlog is normalized against it.
    pub available_memory: u64,

    /// Initial static shares; 0 enables the backlog feedback loop.
    pub static_shares: f64,

    /// Runtime updates to the static shares setting.
    pub static_shares_updates: Option<watch::Receiver<f64>>,

    /// Runtime updates to the compaction bandwidth cap, in MiB/s, 0 meaning
    /// unlimited. Bandwidth throttling is node-wide, so only the primary
    /// shard's manager should be handed this receiver.
    pub throughput_mb_per_sec_updates: Option<watch::Receiver<u32>>,

    pub options: CompactionManagerOptions,
}

impl Default for CompactionManagerConfig {
    fn default() -> Self {
        Self {
            compaction_group: SchedulingGroup::unthrottled("compaction"),
            maintenance_group: SchedulingGroup::unthrottled("maintenance"),
            available_memory: 1024 * 1024 * 1024,
            static_shares: 0.0,
            static_shares_updates: None,
            throughput_mb_per_sec_updates: None,
            options: CompactionManagerOptions::default(),
        }
    }
}
