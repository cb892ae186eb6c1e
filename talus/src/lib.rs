#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic, clippy::unwrap_used))]

pub use backlog::{
    BacklogTracker, BacklogTrackerImpl, OngoingCompactions, OngoingWrites, ReadProgress,
    UserInitiatedBacklogTracker, WriteProgress,
};
pub use compaction::{
    CompactionCompletionDesc, CompactionData, CompactionDescriptor, CompactionExecutor,
    CompactionInfo, CompactionOptions, CompactionResult, CompactionType, QuarantineMode,
    ScrubMode, ScrubOptions, SsTableReplacement, SstableReplacer,
};
pub use config::{CompactionManagerConfig, CompactionManagerOptions};
pub use controller::{CompactionController, IoGroup, SchedulingGroup, UnthrottledIoGroup};
pub use error::Error;
pub use manager::{CompactionManager, CompactionReenabler, Stats};
pub use sstable::{needs_cleanup, SsTable, SsTableHandle, SsTableId, TokenRange};
pub use strategy::{CompactionStrategy, ReshapeMode, StrategyControl};
pub use table_state::{in_strategy_sstables, Schema, TableHandle, TableState};
pub use task::TaskState;
pub use tasks::CustomJob;

pub mod backlog;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod sstable;
pub mod stats;
pub mod strategy;
pub mod table_state;

mod registration;
mod task;
mod tasks;
#[cfg(test)]
mod test_utils;
mod utils;
