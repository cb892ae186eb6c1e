use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the compaction manager and its tasks.
///
/// The enum is `Clone` so a single task outcome can be observed by every
/// waiter of its completion cell; payloads that aren't `Clone` (such as
/// `std::io::Error`) are wrapped in `Arc`.
#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Cooperative cancellation. Raised when a task observes its abort
    /// token at a checkpoint (semaphore acquisition, retry sleep, or an
    /// explicit `can_proceed` check with throw-if-stopping).
    #[error("compaction stopped for {table}: {reason}")]
    Stopped { table: String, reason: String },

    /// A compaction precondition was violated by an external system while
    /// the job was running.
    #[error("compaction aborted for {table}: {reason}")]
    Aborted { table: String, reason: String },

    /// Disk failure. Escalates to a manager-wide stop.
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] Arc<std::io::Error>),

    #[error("table {table} is not registered with the compaction manager")]
    TableNotFound { table: String },

    #[error("there is an ongoing cleanup on {table}")]
    CleanupInProgress { table: String },

    #[error("invalid argument: {msg}")]
    InvalidArgument { msg: String },

    /// The per-table gate was closed (table being removed); no new work may
    /// start on its behalf.
    #[error("compaction gate closed for {table}")]
    GateClosed { table: String },

    /// The manager is shutting down and can no longer service the request.
    #[error("compaction manager shut down")]
    Shutdown,

    #[error("unexpected error: {msg}")]
    Unexpected { msg: String },
}

impl Error {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped { .. })
    }

    pub fn is_storage_io(&self) -> bool {
        matches!(self, Error::StorageIo(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::StorageIo(Arc::new(value))
    }
}
