//! In-process worker backends
//!
//! Deterministic implementations of the worker and data-plane client traits,
//! suitable for development, testing, and single-process deployments. The
//! index worker "builds" by waiting out a configurable delay and writing
//! artifact keys to the object store; fault injection hooks simulate crashes
//! and permanent build failures.

use crate::cluster::worker::{
    ChannelReport, CreateJobRequest, DataCoord, DataDistribution, IndexWorker, IndexWorkerFactory,
    JobResult, JobStats, LeaderViewReport, QueryWorker, QueryWorkerFactory, RecoveryInfo,
    SegmentLoadInfo, SegmentReport, SegmentVersion, SyncAction, SyncDistributionRequest,
};
use crate::types::{
    BuildId, CollectionId, ComponentStates, DmChannel, IndexState, NodeId, PartitionId, SegmentId,
    SegmentInfo, StateCode,
};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct LocalJob {
    req: CreateJobRequest,
    started: Instant,
    state: IndexState,
    fail: bool,
    file_keys: Vec<String>,
    index_size: i64,
}

/// In-process index build worker.
pub struct LocalIndexWorker {
    node_id: NodeId,
    jobs: DashMap<BuildId, LocalJob>,
    build_delay: Duration,
    fail_next: AtomicBool,
    offline: AtomicBool,
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl LocalIndexWorker {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            jobs: DashMap::new(),
            build_delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            object_store: None,
        }
    }

    /// Simulate build time; jobs report InProgress until the delay elapses.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Write artifact files on job completion.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// The next accepted job will end in `Failed`.
    pub fn fail_next_job(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Refuse all rpcs while set, as a crashed process would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|e| e.state == IndexState::InProgress)
            .count()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Rpc(format!(
                "connection refused: index worker {}",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexWorker for LocalIndexWorker {
    async fn create_job(&self, req: CreateJobRequest) -> Result<()> {
        self.check_online()?;
        let fail = self.fail_next.swap(false, Ordering::SeqCst);
        debug!(build_id = req.build_id, node_id = self.node_id, "accepted build job");
        self.jobs.insert(
            req.build_id,
            LocalJob {
                req,
                started: Instant::now(),
                state: IndexState::InProgress,
                fail,
                file_keys: Vec::new(),
                index_size: 0,
            },
        );
        Ok(())
    }

    async fn query_jobs(&self, build_ids: &[BuildId]) -> Result<Vec<JobResult>> {
        self.check_online()?;
        let mut results = Vec::with_capacity(build_ids.len());
        let mut newly_finished = Vec::new();

        for build_id in build_ids {
            let Some(mut job) = self.jobs.get_mut(build_id) else {
                // unknown jobs are absent from the response
                continue;
            };
            if job.state == IndexState::InProgress && job.started.elapsed() >= self.build_delay {
                if job.fail {
                    job.state = IndexState::Failed;
                } else {
                    job.state = IndexState::Finished;
                    job.file_keys = (0..2)
                        .map(|i| format!("{}/part_{i}", job.req.storage_path))
                        .collect();
                    job.index_size = job.req.num_rows * 4;
                    newly_finished.push((job.file_keys.clone(), job.req.num_rows));
                }
            }
            results.push(JobResult {
                build_id: *build_id,
                state: job.state,
                file_keys: job.file_keys.clone(),
                index_size: job.index_size,
                fail_reason: if job.state == IndexState::Failed {
                    "simulated build failure".to_string()
                } else {
                    String::new()
                },
            });
        }

        if let Some(store) = &self.object_store {
            for (file_keys, num_rows) in newly_finished {
                for key in file_keys {
                    let payload = PutPayload::from(vec![0u8; (num_rows as usize).min(64)]);
                    store
                        .put(&object_store::path::Path::from(key.as_str()), payload)
                        .await?;
                }
            }
        }
        Ok(results)
    }

    async fn drop_jobs(&self, build_ids: &[BuildId]) -> Result<()> {
        self.check_online()?;
        for build_id in build_ids {
            self.jobs.remove(build_id);
        }
        Ok(())
    }

    async fn get_job_stats(&self) -> Result<JobStats> {
        self.check_online()?;
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            match entry.state {
                IndexState::InProgress => stats.in_progress += 1,
                IndexState::Finished => stats.finished += 1,
                IndexState::Failed => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn get_component_states(&self) -> Result<ComponentStates> {
        self.check_online()?;
        Ok(ComponentStates {
            node_id: self.node_id,
            role: crate::cluster::ROLE_INDEX_WORKER.to_string(),
            state_code: StateCode::Healthy,
        })
    }
}

/// In-process query worker.
pub struct LocalQueryWorker {
    node_id: NodeId,
    segments: DashMap<SegmentId, SegmentReport>,
    channels: DashMap<String, ChannelReport>,
    /// channel -> sealed segment map this worker leads
    leader_sealed: DashMap<String, HashMap<SegmentId, SegmentVersion>>,
    version: AtomicI64,
    offline: AtomicBool,
}

impl LocalQueryWorker {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            segments: DashMap::new(),
            channels: DashMap::new(),
            leader_sealed: DashMap::new(),
            version: AtomicI64::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn loaded_segment_count(&self) -> usize {
        self.segments.len()
    }

    fn next_version(&self) -> i64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Rpc(format!(
                "connection refused: query worker {}",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryWorker for LocalQueryWorker {
    async fn get_data_distribution(&self) -> Result<DataDistribution> {
        self.check_online()?;
        let segments = self.segments.iter().map(|e| e.value().clone()).collect();
        let channels = self.channels.iter().map(|e| e.value().clone()).collect();
        let leader_views = self
            .channels
            .iter()
            .map(|entry| LeaderViewReport {
                collection_id: entry.value().collection_id,
                channel: entry.key().clone(),
                sealed_segments: self
                    .leader_sealed
                    .get(entry.key())
                    .map(|m| m.value().clone())
                    .unwrap_or_default(),
                growing_segments: HashMap::new(),
            })
            .collect();
        Ok(DataDistribution {
            segments,
            channels,
            leader_views,
        })
    }

    async fn watch_dm_channels(&self, channel: DmChannel) -> Result<()> {
        self.check_online()?;
        let version = self.next_version();
        self.leader_sealed
            .entry(channel.channel_name.clone())
            .or_default();
        self.channels.insert(
            channel.channel_name.clone(),
            ChannelReport {
                collection_id: channel.collection_id,
                channel_name: channel.channel_name,
                version,
            },
        );
        Ok(())
    }

    async fn unsub_dm_channel(&self, _collection_id: CollectionId, channel: &str) -> Result<()> {
        self.check_online()?;
        self.channels.remove(channel);
        self.leader_sealed.remove(channel);
        Ok(())
    }

    async fn load_segments(&self, segments: Vec<SegmentLoadInfo>) -> Result<()> {
        self.check_online()?;
        for info in segments {
            let version = self.next_version();
            let segment = &info.segment;
            self.segments.insert(
                segment.segment_id,
                SegmentReport {
                    segment_id: segment.segment_id,
                    collection_id: segment.collection_id,
                    partition_id: segment.partition_id,
                    channel: segment.insert_channel.clone(),
                    num_rows: segment.num_rows,
                    version,
                },
            );
            // a leader for the segment's channel serves it immediately
            if let Some(mut sealed) = self.leader_sealed.get_mut(&segment.insert_channel) {
                sealed.insert(
                    segment.segment_id,
                    SegmentVersion {
                        node_id: self.node_id,
                        version,
                    },
                );
            }
        }
        Ok(())
    }

    async fn release_collection(&self, collection_id: CollectionId) -> Result<()> {
        self.check_online()?;
        self.segments.retain(|_, s| s.collection_id != collection_id);
        let dropped: Vec<String> = self
            .channels
            .iter()
            .filter(|e| e.value().collection_id == collection_id)
            .map(|e| e.key().clone())
            .collect();
        for channel in dropped {
            self.channels.remove(&channel);
            self.leader_sealed.remove(&channel);
        }
        Ok(())
    }

    async fn release_partitions(
        &self,
        collection_id: CollectionId,
        partition_ids: &[PartitionId],
    ) -> Result<()> {
        self.check_online()?;
        let victims: Vec<SegmentId> = self
            .segments
            .iter()
            .filter(|e| {
                e.value().collection_id == collection_id
                    && partition_ids.contains(&e.value().partition_id)
            })
            .map(|e| *e.key())
            .collect();
        self.release_segments(collection_id, &victims).await
    }

    async fn release_segments(
        &self,
        _collection_id: CollectionId,
        segment_ids: &[SegmentId],
    ) -> Result<()> {
        self.check_online()?;
        for segment_id in segment_ids {
            self.segments.remove(segment_id);
            for mut sealed in self.leader_sealed.iter_mut() {
                sealed.remove(segment_id);
            }
        }
        Ok(())
    }

    async fn sync_distribution(&self, req: SyncDistributionRequest) -> Result<()> {
        self.check_online()?;
        let mut sealed = self.leader_sealed.entry(req.channel.clone()).or_default();
        for action in req.actions {
            match action {
                SyncAction::Set {
                    segment_id,
                    node_id,
                    version,
                } => {
                    sealed.insert(segment_id, SegmentVersion { node_id, version });
                }
                SyncAction::Remove { segment_id } => {
                    sealed.remove(&segment_id);
                }
            }
        }
        Ok(())
    }

    async fn sync_replica_segments(
        &self,
        _collection_id: CollectionId,
        _segment_ids: &[SegmentId],
    ) -> Result<()> {
        self.check_online()
    }

    async fn get_component_states(&self) -> Result<ComponentStates> {
        self.check_online()?;
        Ok(ComponentStates {
            node_id: self.node_id,
            role: crate::cluster::ROLE_QUERY_WORKER.to_string(),
            state_code: StateCode::Healthy,
        })
    }
}

/// Registry-backed factory resolving index worker clients in-process.
#[derive(Default)]
pub struct LocalIndexWorkerFactory {
    workers: DashMap<NodeId, Arc<dyn IndexWorker>>,
}

impl LocalIndexWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, worker: Arc<dyn IndexWorker>) {
        self.workers.insert(node_id, worker);
    }
}

#[async_trait]
impl IndexWorkerFactory for LocalIndexWorkerFactory {
    async fn connect(&self, node_id: NodeId, _address: &str) -> Result<Arc<dyn IndexWorker>> {
        self.workers
            .get(&node_id)
            .map(|w| w.value().clone())
            .ok_or(Error::NodeNotFound(node_id))
    }
}

/// Registry-backed factory resolving query worker clients in-process.
#[derive(Default)]
pub struct LocalQueryWorkerFactory {
    workers: DashMap<NodeId, Arc<dyn QueryWorker>>,
}

impl LocalQueryWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, worker: Arc<dyn QueryWorker>) {
        self.workers.insert(node_id, worker);
    }
}

#[async_trait]
impl QueryWorkerFactory for LocalQueryWorkerFactory {
    async fn connect(&self, node_id: NodeId, _address: &str) -> Result<Arc<dyn QueryWorker>> {
        self.workers
            .get(&node_id)
            .map(|w| w.value().clone())
            .ok_or(Error::NodeNotFound(node_id))
    }
}

/// In-process data plane coordinator.
#[derive(Default)]
pub struct LocalDataCoord {
    segments: DashMap<SegmentId, SegmentInfo>,
    channels: DashMap<CollectionId, Vec<DmChannel>>,
    locks: DashMap<(BuildId, NodeId), Vec<SegmentId>>,
}

impl LocalDataCoord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flushed segment, visible to existence checks and recovery.
    pub fn add_segment(&self, segment: SegmentInfo) {
        self.segments.insert(segment.segment_id, segment);
    }

    /// Drop a segment, as compaction would.
    pub fn remove_segment(&self, segment_id: SegmentId) {
        self.segments.remove(&segment_id);
    }

    pub fn add_channel(&self, channel: DmChannel) {
        self.channels
            .entry(channel.collection_id)
            .or_default()
            .push(channel);
    }

    pub fn held_lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn is_locked(&self, build_id: BuildId) -> bool {
        self.locks.iter().any(|e| e.key().0 == build_id)
    }
}

#[async_trait]
impl DataCoord for LocalDataCoord {
    async fn acquire_segment_lock(
        &self,
        build_id: BuildId,
        node_id: NodeId,
        segment_ids: &[SegmentId],
    ) -> Result<()> {
        for segment_id in segment_ids {
            if !self.segments.contains_key(segment_id) {
                return Err(Error::SegmentNotFound(*segment_id));
            }
        }
        self.locks.insert((build_id, node_id), segment_ids.to_vec());
        Ok(())
    }

    async fn release_segment_lock(&self, build_id: BuildId, node_id: NodeId) -> Result<()> {
        self.locks.remove(&(build_id, node_id));
        Ok(())
    }

    async fn segment_exists(&self, segment_id: SegmentId) -> Result<bool> {
        Ok(self.segments.contains_key(&segment_id))
    }

    async fn get_segment_info(&self, segment_id: SegmentId) -> Result<Option<SegmentInfo>> {
        Ok(self.segments.get(&segment_id).map(|e| e.value().clone()))
    }

    async fn get_flushed_segments(&self, collection_id: CollectionId) -> Result<Vec<SegmentInfo>> {
        Ok(self
            .segments
            .iter()
            .filter(|e| e.value().collection_id == collection_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get_recovery_info(&self, collection_id: CollectionId) -> Result<RecoveryInfo> {
        Ok(RecoveryInfo {
            segments: self.get_flushed_segments(collection_id).await?,
            channels: self
                .channels
                .get(&collection_id)
                .map(|c| c.value().clone())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: SegmentId, rows: i64) -> SegmentInfo {
        SegmentInfo {
            segment_id: id,
            collection_id: 100,
            partition_id: 1,
            insert_channel: "dml_0".to_string(),
            num_rows: rows,
        }
    }

    #[tokio::test]
    async fn test_index_worker_finishes_jobs() {
        let worker = LocalIndexWorker::new(10);
        worker
            .create_job(CreateJobRequest {
                build_id: 1,
                collection_id: 100,
                partition_id: 1,
                segment_id: 5,
                num_rows: 1000,
                index_name: "vec_idx".to_string(),
                type_params: Default::default(),
                index_params: Default::default(),
                index_version: 1,
                storage_path: "index-files/1".to_string(),
            })
            .await
            .unwrap();

        let results = worker.query_jobs(&[1, 99]).await.unwrap();
        assert_eq!(results.len(), 1, "unknown jobs are omitted");
        assert_eq!(results[0].state, IndexState::Finished);
        assert!(!results[0].file_keys.is_empty());
        assert!(results[0].index_size > 0);
    }

    #[tokio::test]
    async fn test_index_worker_fault_injection() {
        let worker = LocalIndexWorker::new(10);
        worker.fail_next_job();
        worker
            .create_job(CreateJobRequest {
                build_id: 2,
                collection_id: 100,
                partition_id: 1,
                segment_id: 6,
                num_rows: 10,
                index_name: "vec_idx".to_string(),
                type_params: Default::default(),
                index_params: Default::default(),
                index_version: 1,
                storage_path: "index-files/2".to_string(),
            })
            .await
            .unwrap();
        let results = worker.query_jobs(&[2]).await.unwrap();
        assert_eq!(results[0].state, IndexState::Failed);
        assert!(!results[0].fail_reason.is_empty());

        worker.set_offline(true);
        assert!(worker.query_jobs(&[2]).await.is_err());
    }

    #[tokio::test]
    async fn test_query_worker_distribution_roundtrip() {
        let worker = LocalQueryWorker::new(20);
        worker
            .watch_dm_channels(DmChannel {
                collection_id: 100,
                channel_name: "dml_0".to_string(),
            })
            .await
            .unwrap();
        worker
            .load_segments(vec![SegmentLoadInfo {
                segment: segment(5, 100),
                replica_id: 1,
            }])
            .await
            .unwrap();

        let dist = worker.get_data_distribution().await.unwrap();
        assert_eq!(dist.segments.len(), 1);
        assert_eq!(dist.channels.len(), 1);
        assert_eq!(dist.leader_views.len(), 1);
        assert!(dist.leader_views[0].sealed_segments.contains_key(&5));

        worker.release_collection(100).await.unwrap();
        let dist = worker.get_data_distribution().await.unwrap();
        assert!(dist.segments.is_empty());
        assert!(dist.channels.is_empty());
    }

    #[tokio::test]
    async fn test_data_coord_locks() {
        let dc = LocalDataCoord::new();
        dc.add_segment(segment(5, 100));

        dc.acquire_segment_lock(7, 10, &[5]).await.unwrap();
        assert!(dc.is_locked(7));
        dc.release_segment_lock(7, 10).await.unwrap();
        assert!(!dc.is_locked(7));

        // locking a missing segment fails
        assert!(dc.acquire_segment_lock(8, 10, &[99]).await.is_err());
    }
}
