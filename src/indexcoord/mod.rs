//! Index coordinator
//!
//! Schedules index builds across the worker fleet and tracks the resulting
//! artifacts. Owns MetaTable, the builder, the flushed-segment watcher, the
//! garbage collector, handoff publication, and the admission queue; the
//! top-level struct wires them together, gates their start on the
//! active/standby role, and exposes the public operation surface.
//!
//! Every public operation folds failures into a status envelope and never
//! raises.

pub mod builder;
pub mod gc;
pub mod handoff;
pub mod meta_table;
pub mod node_manager;
pub mod scheduler;
pub mod watcher;

pub use meta_table::{CreateIndexSpec, IndexMeta, MetaTable, SegmentIndex};

use crate::clock::BoundedClock;
use crate::cluster::worker::{DataCoord, IndexWorkerFactory};
use crate::cluster::{SessionEvent, SessionManager, ROLE_COORDINATOR, ROLE_INDEX_WORKER};
use crate::config::CoordinatorConfig;
use crate::kv::MetaKv;
use crate::types::{
    BuildId, CollectionId, ComponentStates, ErrorCode, FieldId, IndexId, IndexState, PartitionId,
    RpcStatus, SegmentId, StateCode,
};
use crate::{Error, Result};
use builder::IndexBuilder;
use gc::GarbageCollector;
use handoff::Handoff;
use node_manager::NodeManager;
use object_store::ObjectStore;
use parking_lot::RwLock;
use scheduler::{CreateIndexTask, TaskScheduler};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use watcher::FlushedSegmentWatcher;

/// CreateIndex operation payload.
#[derive(Debug, Clone)]
pub struct CreateIndexRequest {
    pub collection_id: CollectionId,
    pub field_id: FieldId,
    pub index_name: String,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
    /// Allow a second index on an already-indexed field
    pub alternate: bool,
}

/// Aggregate index description.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub collection_id: CollectionId,
    pub field_id: FieldId,
    pub index_id: IndexId,
    pub index_name: String,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
    pub indexed_rows: i64,
    pub total_rows: i64,
    pub state: IndexState,
}

#[derive(Debug, Clone)]
pub struct GetIndexStateResponse {
    pub status: RpcStatus,
    pub state: IndexState,
    pub fail_reason: String,
}

#[derive(Debug, Clone)]
pub struct SegmentIndexState {
    pub segment_id: SegmentId,
    pub state: IndexState,
    pub fail_reason: String,
}

#[derive(Debug, Clone)]
pub struct GetSegmentIndexStateResponse {
    pub status: RpcStatus,
    pub states: Vec<SegmentIndexState>,
}

#[derive(Debug, Clone)]
pub struct GetIndexBuildProgressResponse {
    pub status: RpcStatus,
    pub indexed_rows: i64,
    pub total_rows: i64,
}

#[derive(Debug, Clone)]
pub struct DescribeIndexResponse {
    pub status: RpcStatus,
    pub indexes: Vec<IndexInfo>,
}

/// Artifact locations of one finished build.
#[derive(Debug, Clone)]
pub struct IndexFilePathInfo {
    pub segment_id: SegmentId,
    pub field_id: FieldId,
    pub index_id: IndexId,
    pub build_id: BuildId,
    pub index_name: String,
    pub file_keys: Vec<String>,
    pub index_size: i64,
    pub index_version: i64,
}

#[derive(Debug, Clone)]
pub struct GetIndexInfosResponse {
    pub status: RpcStatus,
    pub infos: HashMap<SegmentId, Vec<IndexFilePathInfo>>,
}

#[derive(Debug, Clone)]
pub struct CheckHealthResponse {
    pub is_healthy: bool,
    pub reasons: Vec<String>,
}

pub struct IndexCoordinator {
    config: CoordinatorConfig,
    meta: Arc<MetaTable>,
    node_manager: Arc<NodeManager>,
    builder: Arc<IndexBuilder>,
    garbage_collector: Arc<GarbageCollector>,
    flushed_segment_watcher: Arc<FlushedSegmentWatcher>,
    handoff: Arc<Handoff>,
    scheduler: Arc<TaskScheduler>,
    data_coord: Arc<dyn DataCoord>,
    worker_factory: Arc<dyn IndexWorkerFactory>,
    sessions: SessionManager,
    state: RwLock<StateCode>,
    root: CancellationToken,
}

impl IndexCoordinator {
    pub async fn new(
        config: CoordinatorConfig,
        kv: Arc<dyn MetaKv>,
        object_store: Arc<dyn ObjectStore>,
        data_coord: Arc<dyn DataCoord>,
        worker_factory: Arc<dyn IndexWorkerFactory>,
    ) -> Result<Arc<Self>> {
        let clock = Arc::new(BoundedClock::default());
        let meta = Arc::new(MetaTable::new(kv.clone(), clock.clone()).await?);
        let node_manager = Arc::new(NodeManager::new(config.index.node_heartbeat_ttl));
        let handoff = Arc::new(Handoff::new(kv.clone(), meta.clone()));
        let builder = Arc::new(IndexBuilder::new(
            meta.clone(),
            node_manager.clone(),
            data_coord.clone(),
            handoff.clone(),
            config.index.clone(),
        ));
        let garbage_collector = Arc::new(GarbageCollector::new(
            meta.clone(),
            object_store,
            data_coord.clone(),
            clock,
            config.index.clone(),
        ));
        let flushed_segment_watcher = Arc::new(FlushedSegmentWatcher::new(
            kv.clone(),
            meta.clone(),
            data_coord.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(config.index.task_queue_capacity));

        Ok(Arc::new(Self {
            config,
            meta,
            node_manager,
            builder,
            garbage_collector,
            flushed_segment_watcher,
            handoff,
            scheduler,
            data_coord,
            worker_factory,
            sessions: SessionManager::new(kv),
            state: RwLock::new(StateCode::Initializing),
            root: CancellationToken::new(),
        }))
    }

    pub fn meta(&self) -> Arc<MetaTable> {
        self.meta.clone()
    }

    /// Cancelled when the coordinator shuts down, including a revoked
    /// session; the embedding process exits non-zero so a supervisor
    /// restarts it.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Register the coordinator session and start the loops. With
    /// active/standby enabled the caller is expected to have won the election
    /// first; promotion reloads MetaTable from the store before serving.
    pub async fn start(&self) -> Result<()> {
        self.sessions
            .register(ROLE_COORDINATOR, self.config.node_id, "index-coordinator")
            .await?;
        {
            let root = self.root.clone();
            self.sessions.spawn_liveness_check(
                ROLE_COORDINATOR,
                self.config.node_id,
                self.root.clone(),
                move || root.cancel(),
            );
        }
        self.activate().await
    }

    /// Standby -> Active promotion: reload state, discover workers, start
    /// every loop, then serve.
    async fn activate(&self) -> Result<()> {
        self.meta.reload_from_kv().await?;

        if let Some(bind) = &self.config.index.bind_node {
            let client = self
                .worker_factory
                .connect(bind.node_id, &bind.address)
                .await?;
            self.node_manager
                .add_node(bind.node_id, &bind.address, client)
                .await?;
            info!(node_id = bind.node_id, address = %bind.address, "bind mode: static worker registered");
        } else {
            let (sessions, revision) = self.sessions.list(ROLE_INDEX_WORKER).await?;
            for session in sessions {
                match self
                    .worker_factory
                    .connect(session.node_id, &session.address)
                    .await
                {
                    Ok(client) => {
                        if let Err(err) = self
                            .node_manager
                            .add_node(session.node_id, &session.address, client)
                            .await
                        {
                            warn!(node_id = session.node_id, %err, "worker registration failed");
                        }
                    }
                    Err(err) => {
                        warn!(node_id = session.node_id, %err, "worker connect failed")
                    }
                }
            }
            self.spawn_session_watch(revision + 1).await?;
        }

        {
            let builder = self.builder.clone();
            let token = self.root.child_token();
            tokio::spawn(async move { builder.run(token).await });
        }
        {
            let gc = self.garbage_collector.clone();
            let token = self.root.child_token();
            tokio::spawn(async move { gc.run(token).await });
        }
        {
            let handoff = self.handoff.clone();
            let token = self.root.child_token();
            tokio::spawn(async move { handoff.run(token).await });
        }
        {
            let watcher = self.flushed_segment_watcher.clone();
            let token = self.root.child_token();
            tokio::spawn(async move { watcher.run(token).await });
        }
        {
            let scheduler = self.scheduler.clone();
            let token = self.root.child_token();
            tokio::spawn(async move { scheduler.run(token).await });
        }

        *self.state.write() = StateCode::Healthy;
        info!(node_id = self.config.node_id, "index coordinator active");
        Ok(())
    }

    async fn spawn_session_watch(&self, from_revision: u64) -> Result<()> {
        let mut events = self.sessions.watch(ROLE_INDEX_WORKER, from_revision).await?;
        let worker_factory = self.worker_factory.clone();
        let node_manager = self.node_manager.clone();
        let builder = self.builder.clone();
        let token = self.root.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            SessionEvent::Added(session) => {
                                match worker_factory
                                    .connect(session.node_id, &session.address)
                                    .await
                                {
                                    Ok(client) => {
                                        if let Err(err) = node_manager
                                            .add_node(session.node_id, &session.address, client)
                                            .await
                                        {
                                            warn!(node_id = session.node_id, %err,
                                                "worker registration failed");
                                        }
                                    }
                                    Err(err) => warn!(node_id = session.node_id, %err,
                                        "worker connect failed"),
                                }
                            }
                            SessionEvent::Removed { node_id } => {
                                node_manager.remove_node(node_id);
                                builder.node_down(node_id).await;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn stop(&self) {
        *self.state.write() = StateCode::Abnormal;
        self.root.cancel();
        if let Err(err) = self
            .sessions
            .revoke(ROLE_COORDINATOR, self.config.node_id)
            .await
        {
            warn!(%err, "session revoke failed during shutdown");
        }
        info!("index coordinator stopped");
    }

    fn is_healthy(&self) -> bool {
        *self.state.read() == StateCode::Healthy
    }

    fn not_ready() -> RpcStatus {
        RpcStatus::error(ErrorCode::NotReady, "index coordinator is not serving")
    }

    /// Create an index definition and schedule builds for every segment the
    /// data plane has already flushed. Idempotent for an identical request.
    pub async fn create_index(&self, req: CreateIndexRequest) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        let spec = CreateIndexSpec {
            collection_id: req.collection_id,
            field_id: req.field_id,
            index_name: req.index_name,
            type_params: req.type_params,
            index_params: req.index_params,
            alternate: req.alternate,
        };
        let task = CreateIndexTask::new(
            self.meta.clone(),
            self.data_coord.clone(),
            self.scheduler.clone(),
            spec,
        );
        let wait = match self.scheduler.enqueue(Box::new(task), self.root.child_token()) {
            Ok(wait) => wait,
            Err(err) => return RpcStatus::from(&err),
        };
        match wait.await {
            Ok(Ok(())) => RpcStatus::success(),
            Ok(Err(err)) => RpcStatus::from(&err),
            Err(_) => RpcStatus::from(&Error::Internal("scheduler dropped task".to_string())),
        }
    }

    /// Tombstone one index by name, or all of the collection's indexes with
    /// `drop_all`. Removal of rows and files is GC's job.
    pub async fn drop_index(
        &self,
        collection_id: CollectionId,
        _partition_ids: Vec<PartitionId>,
        index_name: &str,
        drop_all: bool,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        let live = self.meta.get_indexes_for_collection(collection_id).await;
        let targets: Vec<IndexId> = if index_name.is_empty() {
            if live.len() > 1 && !drop_all {
                return RpcStatus::from(&Error::AmbiguousDrop(format!(
                    "collection {collection_id} has {} indexes, set drop_all",
                    live.len()
                )));
            }
            live.iter().map(|m| m.index_id).collect()
        } else {
            live.iter()
                .filter(|m| m.index_name == index_name)
                .map(|m| m.index_id)
                .collect()
        };
        if targets.is_empty() {
            // dropping a missing index is a success, matching user intent
            return RpcStatus::success();
        }
        match self.meta.mark_index_as_deleted(collection_id, &targets).await {
            Ok(()) => RpcStatus::success(),
            Err(err) => RpcStatus::from(&err),
        }
    }

    /// Aggregate state of one index across its segments.
    pub async fn get_index_state(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> GetIndexStateResponse {
        if !self.is_healthy() {
            return GetIndexStateResponse {
                status: Self::not_ready(),
                state: IndexState::Failed,
                fail_reason: String::new(),
            };
        }
        let Some(index) = self.meta.get_index_by_name(collection_id, index_name).await else {
            return GetIndexStateResponse {
                status: RpcStatus::error(
                    ErrorCode::IndexNotExist,
                    format!("index not found: {index_name}"),
                ),
                state: IndexState::Failed,
                fail_reason: String::new(),
            };
        };
        let states = self.meta.get_index_states(index.index_id, index.create_ts).await;
        let (state, fail_reason) = aggregate_states(&states);
        GetIndexStateResponse {
            status: RpcStatus::success(),
            state,
            fail_reason,
        }
    }

    pub async fn get_segment_index_state(
        &self,
        collection_id: CollectionId,
        index_name: &str,
        segment_ids: &[SegmentId],
    ) -> GetSegmentIndexStateResponse {
        if !self.is_healthy() {
            return GetSegmentIndexStateResponse {
                status: Self::not_ready(),
                states: Vec::new(),
            };
        }
        let Some(index) = self.meta.get_index_by_name(collection_id, index_name).await else {
            return GetSegmentIndexStateResponse {
                status: RpcStatus::error(
                    ErrorCode::IndexNotExist,
                    format!("index not found: {index_name}"),
                ),
                states: Vec::new(),
            };
        };
        let mut states = Vec::with_capacity(segment_ids.len());
        for segment_id in segment_ids {
            let state = match self.meta.has_same_index(*segment_id, index.index_id).await {
                Some(build_id) => match self.meta.get_segment_index(build_id).await {
                    Some(row) => SegmentIndexState {
                        segment_id: *segment_id,
                        state: row.state,
                        fail_reason: row.fail_reason,
                    },
                    None => SegmentIndexState {
                        segment_id: *segment_id,
                        state: IndexState::Unissued,
                        fail_reason: String::new(),
                    },
                },
                None => SegmentIndexState {
                    segment_id: *segment_id,
                    state: IndexState::Unissued,
                    fail_reason: String::new(),
                },
            };
            states.push(state);
        }
        GetSegmentIndexStateResponse {
            status: RpcStatus::success(),
            states,
        }
    }

    pub async fn get_index_build_progress(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> GetIndexBuildProgressResponse {
        if !self.is_healthy() {
            return GetIndexBuildProgressResponse {
                status: Self::not_ready(),
                indexed_rows: 0,
                total_rows: 0,
            };
        }
        let Some(index) = self.meta.get_index_by_name(collection_id, index_name).await else {
            return GetIndexBuildProgressResponse {
                status: RpcStatus::error(
                    ErrorCode::IndexNotExist,
                    format!("index not found: {index_name}"),
                ),
                indexed_rows: 0,
                total_rows: 0,
            };
        };
        let (indexed_rows, total_rows) = self.progress_of(index.index_id).await;
        GetIndexBuildProgressResponse {
            status: RpcStatus::success(),
            indexed_rows,
            total_rows,
        }
    }

    pub async fn describe_index(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> DescribeIndexResponse {
        if !self.is_healthy() {
            return DescribeIndexResponse {
                status: Self::not_ready(),
                indexes: Vec::new(),
            };
        }
        let live = self.meta.get_indexes_for_collection(collection_id).await;
        let selected: Vec<IndexMeta> = live
            .into_iter()
            .filter(|m| index_name.is_empty() || m.index_name == index_name)
            .collect();
        if selected.is_empty() {
            return DescribeIndexResponse {
                status: RpcStatus::error(
                    ErrorCode::IndexNotExist,
                    format!("index not found: {index_name}"),
                ),
                indexes: Vec::new(),
            };
        }
        let mut indexes = Vec::with_capacity(selected.len());
        for meta in selected {
            let (indexed_rows, total_rows) = self.progress_of(meta.index_id).await;
            let states = self.meta.get_index_states(meta.index_id, meta.create_ts).await;
            let (state, _) = aggregate_states(&states);
            indexes.push(IndexInfo {
                collection_id: meta.collection_id,
                field_id: meta.field_id,
                index_id: meta.index_id,
                index_name: meta.index_name,
                type_params: meta.type_params,
                index_params: meta.index_params,
                indexed_rows,
                total_rows,
                state,
            });
        }
        DescribeIndexResponse {
            status: RpcStatus::success(),
            indexes,
        }
    }

    /// Per-segment artifact descriptors, query-plane input when loading
    /// segments.
    pub async fn get_index_infos(
        &self,
        collection_id: CollectionId,
        segment_ids: &[SegmentId],
        index_name: &str,
    ) -> GetIndexInfosResponse {
        if !self.is_healthy() {
            return GetIndexInfosResponse {
                status: Self::not_ready(),
                infos: HashMap::new(),
            };
        }
        let live = self.meta.get_indexes_for_collection(collection_id).await;
        let mut infos: HashMap<SegmentId, Vec<IndexFilePathInfo>> = HashMap::new();
        for segment_id in segment_ids {
            let mut per_segment = Vec::new();
            for index in &live {
                if !index_name.is_empty() && index.index_name != index_name {
                    continue;
                }
                let Some(build_id) = self.meta.has_same_index(*segment_id, index.index_id).await
                else {
                    continue;
                };
                let Some(row) = self.meta.get_segment_index(build_id).await else {
                    continue;
                };
                if row.state != IndexState::Finished || row.deleted {
                    continue;
                }
                per_segment.push(IndexFilePathInfo {
                    segment_id: *segment_id,
                    field_id: index.field_id,
                    index_id: index.index_id,
                    build_id,
                    index_name: index.index_name.clone(),
                    file_keys: row.file_keys,
                    index_size: row.index_size,
                    index_version: row.index_version,
                });
            }
            infos.insert(*segment_id, per_segment);
        }
        GetIndexInfosResponse {
            status: RpcStatus::success(),
            infos,
        }
    }

    async fn progress_of(&self, index_id: IndexId) -> (i64, i64) {
        let rows = self.meta.get_segment_indexes_of_index(index_id).await;
        let mut indexed_rows = 0;
        let mut total_rows = 0;
        for row in rows.iter().filter(|r| !r.deleted) {
            total_rows += row.num_rows;
            if row.state == IndexState::Finished {
                indexed_rows += row.num_rows;
            }
        }
        (indexed_rows, total_rows)
    }

    pub fn get_component_states(&self) -> ComponentStates {
        ComponentStates {
            node_id: self.config.node_id,
            role: "index-coordinator".to_string(),
            state_code: *self.state.read(),
        }
    }

    /// Health = serving and every registered worker answers a stats probe.
    pub async fn check_health(&self) -> CheckHealthResponse {
        if !self.is_healthy() {
            return CheckHealthResponse {
                is_healthy: false,
                reasons: vec!["coordinator is not serving".to_string()],
            };
        }
        let mut reasons = Vec::new();
        for node in self.node_manager.all_nodes() {
            if let Err(err) = node.client().get_job_stats().await {
                reasons.push(format!("node {} unreachable: {err}", node.node_id));
            }
        }
        CheckHealthResponse {
            is_healthy: reasons.is_empty(),
            reasons,
        }
    }

    /// Config dump for the standard ShowConfigurations surface.
    pub fn show_configurations(&self, pattern: &str) -> Vec<(String, String)> {
        let index = &self.config.index;
        let all = vec![
            (
                "index.builder_tick_interval_ms".to_string(),
                index.builder_tick_interval.as_millis().to_string(),
            ),
            (
                "index.create_job_timeout_secs".to_string(),
                index.create_job_timeout.as_secs().to_string(),
            ),
            (
                "index.node_heartbeat_ttl_secs".to_string(),
                index.node_heartbeat_ttl.as_secs().to_string(),
            ),
            (
                "index.gc_interval_secs".to_string(),
                index.gc_interval.as_secs().to_string(),
            ),
            (
                "index.orphan_timeout_secs".to_string(),
                index.orphan_timeout.as_secs().to_string(),
            ),
            (
                "index.task_queue_capacity".to_string(),
                index.task_queue_capacity.to_string(),
            ),
        ];
        all.into_iter()
            .filter(|(key, _)| pattern.is_empty() || key.contains(pattern))
            .collect()
    }

    /// Lightweight metrics summary for the standard GetMetrics surface.
    pub async fn get_metrics(&self) -> serde_json::Value {
        let unissued = self.meta.segment_indexes_with_state(IndexState::Unissued).await.len();
        let in_progress = self.meta.segment_indexes_with_state(IndexState::InProgress).await.len();
        let finished = self.meta.segment_indexes_with_state(IndexState::Finished).await.len();
        let failed = self.meta.segment_indexes_with_state(IndexState::Failed).await.len();
        serde_json::json!({
            "node_id": self.config.node_id,
            "workers": self.node_manager.node_count(),
            "builds": {
                "unissued": unissued,
                "in_progress": in_progress,
                "finished": finished,
                "failed": failed,
            },
        })
    }
}

/// Fold per-segment states into one index state. Any failure wins; Unissued,
/// Retry, and InProgress all read as InProgress; an index with no pending
/// work is Finished.
fn aggregate_states(states: &[(SegmentId, IndexState, String)]) -> (IndexState, String) {
    for (segment_id, state, reason) in states {
        if *state == IndexState::Failed {
            return (
                IndexState::Failed,
                format!("segment {segment_id}: {reason}"),
            );
        }
    }
    if states
        .iter()
        .any(|(_, state, _)| !matches!(state, IndexState::Finished))
    {
        (IndexState::InProgress, String::new())
    } else {
        (IndexState::Finished, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_states() {
        let states = vec![
            (1, IndexState::Finished, String::new()),
            (2, IndexState::InProgress, String::new()),
        ];
        assert_eq!(aggregate_states(&states).0, IndexState::InProgress);

        let states = vec![
            (1, IndexState::Finished, String::new()),
            (2, IndexState::Failed, "oom".to_string()),
        ];
        let (state, reason) = aggregate_states(&states);
        assert_eq!(state, IndexState::Failed);
        assert!(reason.contains("oom"));

        let states = vec![(1, IndexState::Finished, String::new())];
        assert_eq!(aggregate_states(&states).0, IndexState::Finished);
        assert_eq!(aggregate_states(&[]).0, IndexState::Finished);
    }
}
