//! Worker-facing client traits
//!
//! The coordinators are clients of two worker fleets (index builders and
//! query servers) and of the data plane coordinator. These traits carry the
//! request semantics; transports and the in-process test backend implement
//! them.

use crate::types::{
    BuildId, CollectionId, ComponentStates, DmChannel, IndexState, NodeId, PartitionId, SegmentId,
    SegmentInfo,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One index build job handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub build_id: BuildId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub num_rows: i64,
    pub index_name: String,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
    /// Attempt counter, bumped on every re-issue
    pub index_version: i64,
    /// Object-store prefix the worker writes artifact files under
    pub storage_path: String,
}

/// Per-build result returned by a QueryJobs batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub build_id: BuildId,
    pub state: IndexState,
    pub file_keys: Vec<String>,
    pub index_size: i64,
    pub fail_reason: String,
}

/// Aggregate job counters reported by one index worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub in_progress: usize,
    pub finished: usize,
    pub failed: usize,
}

/// Client of one index build worker.
#[async_trait]
pub trait IndexWorker: Send + Sync {
    async fn create_job(&self, req: CreateJobRequest) -> Result<()>;

    /// Batched job poll. Unknown build ids are absent from the response;
    /// the caller decides how to treat them.
    async fn query_jobs(&self, build_ids: &[BuildId]) -> Result<Vec<JobResult>>;

    async fn drop_jobs(&self, build_ids: &[BuildId]) -> Result<()>;

    async fn get_job_stats(&self) -> Result<JobStats>;

    async fn get_component_states(&self) -> Result<ComponentStates>;
}

/// One sealed segment as reported by a query worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,
    pub num_rows: i64,
    pub version: i64,
}

/// One subscribed channel as reported by a query worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReport {
    pub collection_id: CollectionId,
    pub channel_name: String,
    pub version: i64,
}

/// Location and version of a sealed segment inside a leader view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentVersion {
    pub node_id: NodeId,
    pub version: i64,
}

/// A worker's self-reported view of one shard it leads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderViewReport {
    pub collection_id: CollectionId,
    pub channel: String,
    pub sealed_segments: HashMap<SegmentId, SegmentVersion>,
    /// Growing segment id -> start position in the insert stream
    pub growing_segments: HashMap<SegmentId, i64>,
}

/// Full distribution snapshot pulled from one query worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataDistribution {
    pub segments: Vec<SegmentReport>,
    pub channels: Vec<ChannelReport>,
    pub leader_views: Vec<LeaderViewReport>,
}

/// Segment load order sent to a query worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentLoadInfo {
    pub segment: SegmentInfo,
    pub replica_id: i64,
}

/// One mutation of a leader's sealed-segment map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncAction {
    Set {
        segment_id: SegmentId,
        node_id: NodeId,
        version: i64,
    },
    Remove {
        segment_id: SegmentId,
    },
}

/// SyncDistribution request targeting one shard leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDistributionRequest {
    pub collection_id: CollectionId,
    pub channel: String,
    pub actions: Vec<SyncAction>,
}

/// Client of one query worker.
#[async_trait]
pub trait QueryWorker: Send + Sync {
    async fn get_data_distribution(&self) -> Result<DataDistribution>;

    async fn watch_dm_channels(&self, channel: DmChannel) -> Result<()>;

    async fn unsub_dm_channel(&self, collection_id: CollectionId, channel: &str) -> Result<()>;

    async fn load_segments(&self, segments: Vec<SegmentLoadInfo>) -> Result<()>;

    async fn release_collection(&self, collection_id: CollectionId) -> Result<()>;

    async fn release_partitions(
        &self,
        collection_id: CollectionId,
        partition_ids: &[PartitionId],
    ) -> Result<()>;

    async fn release_segments(
        &self,
        collection_id: CollectionId,
        segment_ids: &[SegmentId],
    ) -> Result<()>;

    async fn sync_distribution(&self, req: SyncDistributionRequest) -> Result<()>;

    async fn sync_replica_segments(
        &self,
        collection_id: CollectionId,
        segment_ids: &[SegmentId],
    ) -> Result<()>;

    async fn get_component_states(&self) -> Result<ComponentStates>;
}

/// Connector from discovered `(node_id, address)` pairs to index worker
/// clients. The transport-backed implementation dials the address; the
/// in-process one resolves a registry.
#[async_trait]
pub trait IndexWorkerFactory: Send + Sync {
    async fn connect(&self, node_id: NodeId, address: &str) -> Result<Arc<dyn IndexWorker>>;
}

/// Connector from discovered `(node_id, address)` pairs to query worker
/// clients.
#[async_trait]
pub trait QueryWorkerFactory: Send + Sync {
    async fn connect(&self, node_id: NodeId, address: &str) -> Result<Arc<dyn QueryWorker>>;
}

/// Desired-state snapshot returned by the data plane for one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub segments: Vec<SegmentInfo>,
    pub channels: Vec<DmChannel>,
}

/// Client of the data plane coordinator.
///
/// Segment reference locks keep a segment from being compacted away while an
/// index build reads it; the data plane times them out independently if this
/// coordinator crashes.
#[async_trait]
pub trait DataCoord: Send + Sync {
    async fn acquire_segment_lock(
        &self,
        build_id: BuildId,
        node_id: NodeId,
        segment_ids: &[SegmentId],
    ) -> Result<()>;

    async fn release_segment_lock(&self, build_id: BuildId, node_id: NodeId) -> Result<()>;

    async fn segment_exists(&self, segment_id: SegmentId) -> Result<bool>;

    async fn get_segment_info(&self, segment_id: SegmentId) -> Result<Option<SegmentInfo>>;

    async fn get_flushed_segments(&self, collection_id: CollectionId) -> Result<Vec<SegmentInfo>>;

    async fn get_recovery_info(&self, collection_id: CollectionId) -> Result<RecoveryInfo>;
}
