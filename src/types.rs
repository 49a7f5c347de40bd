//! Shared identifiers and cross-component records.
//!
//! Everything the two coordinators exchange with workers or persist to the
//! metadata store is expressed in terms of these types. The RPC transport
//! itself lives outside this crate; requests and responses here carry the
//! semantics only.

use serde::{Deserialize, Serialize};

/// Unique identifier of a collection.
pub type CollectionId = i64;
/// Unique identifier of a partition within a collection.
pub type PartitionId = i64;
/// Unique identifier of a sealed segment.
pub type SegmentId = i64;
/// Unique identifier of a schema field.
pub type FieldId = i64;
/// Unique identifier of an index definition.
pub type IndexId = i64;
/// Cluster-unique identifier of one index build invocation.
pub type BuildId = i64;
/// Unique identifier of a worker node.
pub type NodeId = i64;
/// Unique identifier of a replica group.
pub type ReplicaId = i64;

/// Error codes carried in the RPC status envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    UnexpectedError,
    IndexNotExist,
    CollectionNotFound,
    NoAvailableNode,
    NotReady,
}

/// Symmetric request/response status envelope.
///
/// Public coordinator operations never raise; they fold failures into this
/// envelope and let callers inspect `error_code`/`reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub error_code: ErrorCode,
    pub reason: String,
}

impl RpcStatus {
    pub fn success() -> Self {
        Self {
            error_code: ErrorCode::Success,
            reason: String::new(),
        }
    }

    pub fn error(error_code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            error_code,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }
}

impl From<&crate::Error> for RpcStatus {
    fn from(err: &crate::Error) -> Self {
        let code = match err {
            crate::Error::IndexNotFound(_) => ErrorCode::IndexNotExist,
            crate::Error::CollectionNotFound(_) => ErrorCode::CollectionNotFound,
            crate::Error::NoAvailableNode | crate::Error::NotEnoughNodes { .. } => {
                ErrorCode::NoAvailableNode
            }
            crate::Error::NotActive => ErrorCode::NotReady,
            _ => ErrorCode::UnexpectedError,
        };
        RpcStatus::error(code, err.to_string())
    }
}

/// Lifecycle state of a coordinator or worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCode {
    /// Not initialized or shut down
    Abnormal,
    /// Initializing, not yet serving
    Initializing,
    /// Registered as standby, loops not running
    Standby,
    /// Active and serving
    Healthy,
}

/// Component state report, returned by every node and coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStates {
    pub node_id: NodeId,
    pub role: String,
    pub state_code: StateCode,
}

/// State of one index build, persisted per segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Created, not yet assigned to a worker
    Unissued,
    /// Assigned, worker is building
    InProgress,
    /// Build completed, artifact files recorded
    Finished,
    /// Worker reported a permanent failure
    Failed,
    /// Assignment lost, pending re-issue
    Retry,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Unissued => "Unissued",
            IndexState::InProgress => "InProgress",
            IndexState::Finished => "Finished",
            IndexState::Failed => "Failed",
            IndexState::Retry => "Retry",
        }
    }

    /// Terminal states hold a node assignment; so does InProgress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexState::Finished | IndexState::Failed)
    }
}

/// A sealed, immutable shard of a collection's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    /// The insert stream this segment was sealed from
    pub insert_channel: String,
    pub num_rows: i64,
}

/// A logical insert stream a shard leader subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DmChannel {
    pub collection_id: CollectionId,
    pub channel_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_envelope_from_error() {
        let status = RpcStatus::from(&crate::Error::IndexNotFound("vec_idx".to_string()));
        assert_eq!(status.error_code, ErrorCode::IndexNotExist);
        assert!(status.reason.contains("vec_idx"));

        let ok = RpcStatus::success();
        assert!(ok.is_success());
    }

    #[test]
    fn index_state_terminality() {
        assert!(IndexState::Finished.is_terminal());
        assert!(IndexState::Failed.is_terminal());
        assert!(!IndexState::InProgress.is_terminal());
        assert!(!IndexState::Retry.is_terminal());
    }
}
