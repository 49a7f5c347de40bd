//! Error types for lodestone

/// Result type alias for lodestone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lodestone
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Metadata store errors
    #[error("Metadata store error: {0}")]
    Kv(String),
    /// Watch start revision already compacted away
    #[error("Watch revision {requested} compacted, earliest available is {earliest}")]
    KvCompacted { requested: u64, earliest: u64 },
    /// Index already exists with different parameters
    #[error("Index already exists: {0}")]
    IndexConflict(String),
    /// Ambiguous drop request
    #[error("Ambiguous drop: {0}")]
    AmbiguousDrop(String),
    /// Index not found
    #[error("Index not found: {0}")]
    IndexNotFound(String),
    /// Collection not found
    #[error("Collection not found: {0}")]
    CollectionNotFound(i64),
    /// Segment not found
    #[error("Segment not found: {0}")]
    SegmentNotFound(i64),
    /// Build not found
    #[error("Build not found: {0}")]
    BuildNotFound(i64),
    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(i64),
    /// No worker node can take the task
    #[error("No available node")]
    NoAvailableNode,
    /// Not enough nodes to satisfy the requested replica number
    #[error("Not enough nodes: want {want}, have {have}")]
    NotEnoughNodes { want: usize, have: usize },
    /// Admission queue is full
    #[error("Task queue is full")]
    QueueFull,
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
    /// Worker RPC failure
    #[error("Worker rpc error: {0}")]
    Rpc(String),
    /// State machine transition from an impossible state
    #[error("Invalid state transition for build {build_id}: {from} -> {to}")]
    InvalidStateTransition {
        build_id: i64,
        from: &'static str,
        to: &'static str,
    },
    /// Coordinator is not the active instance
    #[error("Coordinator is not active")]
    NotActive,
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether the error is a transient transport failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Rpc(_) | Error::Timeout | Error::Kv(_))
    }
}
