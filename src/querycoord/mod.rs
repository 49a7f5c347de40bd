//! Query coordinator
//!
//! Tracks which collections should be loaded into which query workers,
//! observes worker-reported distributions, and converges the two with
//! load/release/sync actions. Owns Meta, the target and distribution
//! managers, the per-worker dist handlers, the observers, and the balancer;
//! the top-level struct wires them together and exposes the public operation
//! surface.

pub mod balance;
pub mod dist;
pub mod meta;
pub mod observer;
pub mod target;
pub mod task;

pub use balance::{ChannelAssignPlan, RowCountBalancer, SegmentAssignPlan};
pub use dist::{DistHandler, DistributionManager, LeaderView};
pub use meta::{CollectionInfo, LoadStatus, LoadType, Meta, PartitionInfo, Replica};
pub use target::{TargetManager, TargetScope};
pub use task::{Action, ActionScheduler};

use crate::clock::BoundedClock;
use crate::cluster::worker::{DataCoord, QueryWorkerFactory, SegmentLoadInfo};
use crate::cluster::{SessionEvent, SessionManager, ROLE_COORDINATOR, ROLE_QUERY_WORKER};
use crate::config::CoordinatorConfig;
use crate::kv::MetaKv;
use crate::types::{
    CollectionId, ComponentStates, ErrorCode, NodeId, PartitionId, RpcStatus, SegmentId, StateCode,
};
use crate::{Error, Result};
use dashmap::DashMap;
use observer::{CollectionObserver, LeaderObserver};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shard leadership listing for one channel.
#[derive(Debug, Clone)]
pub struct ShardLeaders {
    pub channel: String,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct GetShardLeadersResponse {
    pub status: RpcStatus,
    pub leaders: Vec<ShardLeaders>,
}

#[derive(Debug, Clone)]
pub struct CheckHealthResponse {
    pub is_healthy: bool,
    pub reasons: Vec<String>,
}

/// Worker membership plumbing: connects clients, starts and stops one dist
/// handler per worker. Cloned into the session-watch task.
#[derive(Clone)]
struct WorkerWiring {
    factory: Arc<dyn QueryWorkerFactory>,
    actions: Arc<ActionScheduler>,
    dist: Arc<DistributionManager>,
    handler_tokens: Arc<DashMap<NodeId, CancellationToken>>,
    pull_interval: Duration,
    req_timeout: Duration,
    root: CancellationToken,
}

impl WorkerWiring {
    async fn add_worker(&self, node_id: NodeId, address: &str) {
        match self.factory.connect(node_id, address).await {
            Ok(client) => {
                self.actions.register_worker(node_id, client.clone());
                let token = self.root.child_token();
                self.handler_tokens.insert(node_id, token.clone());
                let handler = DistHandler::new(
                    node_id,
                    client,
                    self.dist.clone(),
                    self.actions.clone(),
                    self.pull_interval,
                    self.req_timeout,
                );
                tokio::spawn(async move { handler.run(token).await });
                info!(node_id, address, "query worker registered");
            }
            Err(err) => warn!(node_id, address, %err, "query worker connect failed"),
        }
    }

    fn drop_worker(&self, node_id: NodeId) {
        if let Some((_, token)) = self.handler_tokens.remove(&node_id) {
            token.cancel();
        }
        self.actions.remove_worker(node_id);
        self.dist.remove_node(node_id);
        info!(node_id, "query worker removed");
    }
}

/// Assignment and migration planning over live managers. Shared between the
/// coordinator's request path and the periodic balance loop.
struct BalanceDriver {
    meta: Arc<Meta>,
    target: Arc<TargetManager>,
    dist: Arc<DistributionManager>,
    actions: Arc<ActionScheduler>,
    balancer: RowCountBalancer,
}

impl BalanceDriver {
    fn collection_rows_on_node(&self, collection_id: CollectionId, node_id: NodeId) -> i64 {
        self.dist
            .segments_on_node(node_id)
            .iter()
            .filter(|s| s.collection_id == collection_id)
            .map(|s| s.num_rows)
            .sum()
    }

    /// Partitions in scope for a partition-loaded collection; None means the
    /// whole collection.
    async fn partition_filter(&self, collection_id: CollectionId) -> Option<HashSet<PartitionId>> {
        let info = self.meta.get_collection(collection_id).await?;
        if info.load_type != LoadType::Partition {
            return None;
        }
        Some(
            self.meta
                .partitions_of(collection_id)
                .await
                .into_iter()
                .map(|p| p.partition_id)
                .collect(),
        )
    }

    async fn balance_tick(&self) {
        for info in self.meta.collections().await {
            self.balance_collection(info.collection_id).await;
        }
    }

    /// One assignment/migration pass over every replica of a collection.
    /// Assignment of unplaced target segments and channels runs regardless of
    /// load status; migration only once Loaded.
    async fn balance_collection(&self, collection_id: CollectionId) {
        let Some(info) = self.meta.get_collection(collection_id).await else {
            return;
        };
        let filter = self.partition_filter(collection_id).await;
        let segments: Vec<_> = self
            .target
            .get_segments(collection_id, TargetScope::Current)
            .into_iter()
            .filter(|s| {
                filter
                    .as_ref()
                    .map(|set| set.contains(&s.partition_id))
                    .unwrap_or(true)
            })
            .collect();
        let channels = self.target.get_channels(collection_id, TargetScope::Current);

        for replica in self.meta.replicas_of(collection_id).await {
            // unplaced segments in this replica
            let pending: Vec<_> = segments
                .iter()
                .filter(|segment| {
                    !self.actions.is_load_pending(segment.segment_id)
                        && !replica
                            .node_ids
                            .iter()
                            .any(|node| self.dist.node_has_segment(*node, segment.segment_id))
                })
                .cloned()
                .collect();
            let row_counts: HashMap<NodeId, i64> = replica
                .node_ids
                .iter()
                .map(|node| (*node, self.collection_rows_on_node(collection_id, *node)))
                .collect();
            for plan in self.balancer.assign_segments(replica.id, &row_counts, pending) {
                self.actions.submit(Action::LoadSegment {
                    node_id: plan.to,
                    segment: SegmentLoadInfo {
                        segment: plan.segment,
                        replica_id: plan.replica_id,
                    },
                });
                self.actions.dispatch(plan.to).await;
            }

            // unsubscribed channels in this replica
            let pending_channels: Vec<_> = channels
                .iter()
                .filter(|channel| {
                    !replica
                        .node_ids
                        .iter()
                        .any(|node| self.dist.node_has_channel(*node, &channel.channel_name))
                })
                .cloned()
                .collect();
            let channel_counts: HashMap<NodeId, usize> = replica
                .node_ids
                .iter()
                .map(|node| (*node, self.dist.channels_on_node(*node).len()))
                .collect();
            for plan in self
                .balancer
                .assign_channels(replica.id, &channel_counts, pending_channels)
            {
                self.actions.submit(Action::SubscribeChannel {
                    node_id: plan.to,
                    channel: plan.channel,
                });
                self.actions.dispatch(plan.to).await;
            }

            // channels dropped from the target are unsubscribed
            if self.target.has_target(collection_id, TargetScope::Current) {
                for node in &replica.node_ids {
                    for report in self.dist.channels_on_node(*node) {
                        if report.collection_id == collection_id
                            && !channels.iter().any(|c| c.channel_name == report.channel_name)
                        {
                            self.actions.submit(Action::UnsubChannel {
                                node_id: *node,
                                collection_id,
                                channel: report.channel_name,
                            });
                            self.actions.dispatch(*node).await;
                        }
                    }
                }
            }

            // migration only for loaded collections
            if info.status != LoadStatus::Loaded {
                continue;
            }
            let mut by_node: HashMap<NodeId, Vec<_>> = HashMap::new();
            for node in &replica.node_ids {
                let segs = self
                    .dist
                    .segments_on_node(*node)
                    .into_iter()
                    .filter(|s| s.collection_id == collection_id)
                    .filter_map(|s| {
                        self.target
                            .get_segment(collection_id, s.segment_id, TargetScope::Current)
                    })
                    .collect();
                by_node.insert(*node, segs);
            }
            let moves = self.balancer.plan_moves(replica.id, &by_node);
            if !moves.is_empty() {
                debug!(collection_id, replica_id = replica.id, moves = moves.len(), "rebalancing");
            }
            for plan in moves {
                let from = plan.from.expect("moves always carry a source");
                self.actions.submit(Action::LoadSegment {
                    node_id: plan.to,
                    segment: SegmentLoadInfo {
                        segment: plan.segment.clone(),
                        replica_id: plan.replica_id,
                    },
                });
                self.actions.submit(Action::ReleaseSegment {
                    node_id: from,
                    collection_id,
                    segment_id: plan.segment.segment_id,
                });
                self.actions.dispatch(plan.to).await;
                self.actions.dispatch(from).await;
            }
        }
    }
}

pub struct QueryCoordinator {
    config: CoordinatorConfig,
    meta: Arc<Meta>,
    target: Arc<TargetManager>,
    dist: Arc<DistributionManager>,
    actions: Arc<ActionScheduler>,
    balance: Arc<BalanceDriver>,
    wiring: WorkerWiring,
    sessions: SessionManager,
    clock: Arc<BoundedClock>,
    state: RwLock<StateCode>,
    root: CancellationToken,
}

impl QueryCoordinator {
    pub async fn new(
        config: CoordinatorConfig,
        kv: Arc<dyn MetaKv>,
        broker: Arc<dyn DataCoord>,
        worker_factory: Arc<dyn QueryWorkerFactory>,
    ) -> Result<Arc<Self>> {
        let clock = Arc::new(BoundedClock::default());
        let meta = Arc::new(Meta::new(kv.clone(), clock.clone()).await?);
        let target = Arc::new(TargetManager::new(broker));
        let dist = Arc::new(DistributionManager::new());
        let actions = Arc::new(ActionScheduler::new(config.query.action_retry_limit));
        let root = CancellationToken::new();

        let balance = Arc::new(BalanceDriver {
            meta: meta.clone(),
            target: target.clone(),
            dist: dist.clone(),
            actions: actions.clone(),
            balancer: RowCountBalancer::new(config.query.balance_threshold_ratio),
        });
        let wiring = WorkerWiring {
            factory: worker_factory,
            actions: actions.clone(),
            dist: dist.clone(),
            handler_tokens: Arc::new(DashMap::new()),
            pull_interval: config.query.dist_pull_interval,
            req_timeout: config.query.dist_req_timeout,
            root: root.clone(),
        };

        Ok(Arc::new(Self {
            config,
            meta,
            target,
            dist,
            actions,
            balance,
            wiring,
            sessions: SessionManager::new(kv),
            clock,
            state: RwLock::new(StateCode::Initializing),
            root,
        }))
    }

    pub fn meta(&self) -> Arc<Meta> {
        self.meta.clone()
    }

    pub fn target(&self) -> Arc<TargetManager> {
        self.target.clone()
    }

    pub fn dist(&self) -> Arc<DistributionManager> {
        self.dist.clone()
    }

    /// Register the coordinator session, recover meta, discover workers, and
    /// start the loops. Recovery rebuilds Current targets for collections
    /// that were loaded before the restart; Next is always rebuilt on the
    /// next refresh.
    pub async fn start(&self) -> Result<()> {
        self.sessions
            .register(ROLE_COORDINATOR, self.config.node_id, "query-coordinator")
            .await?;
        self.meta.reload_from_kv().await?;

        // rebuild Current from the data plane for every recovered collection
        for info in self.meta.collections().await {
            if let Err(err) = self.target.update_collection_next_target(info.collection_id).await {
                warn!(collection_id = info.collection_id, %err, "target recovery failed");
                continue;
            }
            self.target.update_collection_current_target(info.collection_id);
        }

        let (sessions, revision) = self.sessions.list(ROLE_QUERY_WORKER).await?;
        for session in sessions {
            self.wiring.add_worker(session.node_id, &session.address).await;
        }
        self.spawn_session_watch(revision + 1).await?;

        let collection_observer = CollectionObserver::new(
            self.meta.clone(),
            self.target.clone(),
            self.dist.clone(),
            self.actions.clone(),
            self.clock.clone(),
            self.config.query.observer_interval,
            self.config.query.load_timeout,
        );
        {
            let token = self.root.child_token();
            tokio::spawn(async move { collection_observer.run(token).await });
        }

        let leader_observer = LeaderObserver::new(
            self.meta.clone(),
            self.target.clone(),
            self.dist.clone(),
            self.actions.clone(),
            self.config.query.observer_interval,
        );
        {
            let token = self.root.child_token();
            tokio::spawn(async move { leader_observer.run(token).await });
        }

        {
            let balance = self.balance.clone();
            let token = self.root.child_token();
            let interval = self.config.query.balance_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => balance.balance_tick().await,
                    }
                }
            });
        }

        *self.state.write() = StateCode::Healthy;
        info!(node_id = self.config.node_id, "query coordinator active");
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
        info!("query coordinator stopped");
    }

    async fn spawn_session_watch(&self, from_revision: u64) -> Result<()> {
        let mut events = self.sessions.watch(ROLE_QUERY_WORKER, from_revision).await?;
        let wiring = self.wiring.clone();
        let token = self.root.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            SessionEvent::Added(session) => {
                                wiring.add_worker(session.node_id, &session.address).await;
                            }
                            SessionEvent::Removed { node_id } => wiring.drop_worker(node_id),
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        *self.state.read() == StateCode::Healthy
    }

    fn not_ready() -> RpcStatus {
        RpcStatus::error(ErrorCode::NotReady, "query coordinator is not serving")
    }

    /// Load a whole collection at the requested replica number. Returns
    /// immediately; convergence is observer- and balancer-driven.
    pub async fn load_collection(
        &self,
        collection_id: CollectionId,
        replica_number: usize,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        if self.meta.exist(collection_id).await {
            return RpcStatus::success();
        }
        match self
            .admit_load(collection_id, replica_number, LoadType::Collection)
            .await
        {
            Ok(()) => RpcStatus::success(),
            Err(err) => RpcStatus::from(&err),
        }
    }

    /// Load selected partitions of a collection.
    pub async fn load_partitions(
        &self,
        collection_id: CollectionId,
        partition_ids: Vec<PartitionId>,
        replica_number: usize,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        if partition_ids.is_empty() {
            return RpcStatus::error(ErrorCode::UnexpectedError, "no partitions to load");
        }
        if self.meta.exist(collection_id).await {
            // loading further partitions of a partition-loaded collection
            let Some(info) = self.meta.get_collection(collection_id).await else {
                return RpcStatus::from(&Error::CollectionNotFound(collection_id));
            };
            if info.load_type != LoadType::Partition {
                return RpcStatus::error(
                    ErrorCode::UnexpectedError,
                    "collection is already fully loaded",
                );
            }
            for partition_id in &partition_ids {
                if let Err(err) = self.meta.put_partition(collection_id, *partition_id).await {
                    return RpcStatus::from(&err);
                }
            }
            return RpcStatus::success();
        }
        let admitted = self
            .admit_load(collection_id, replica_number, LoadType::Partition)
            .await;
        if let Err(err) = admitted {
            return RpcStatus::from(&err);
        }
        for partition_id in partition_ids {
            if let Err(err) = self.meta.put_partition(collection_id, partition_id).await {
                return RpcStatus::from(&err);
            }
        }
        RpcStatus::success()
    }

    async fn admit_load(
        &self,
        collection_id: CollectionId,
        replica_number: usize,
        load_type: LoadType,
    ) -> Result<()> {
        let nodes = self.actions.worker_ids();
        let replicas = self
            .meta
            .allocate_replicas(collection_id, replica_number, nodes)
            .await?;
        if let Err(err) = self.target.update_collection_next_target(collection_id).await {
            // roll the partial admission back; re-running the load is safe
            let _ = self.meta.remove_collection(collection_id).await;
            return Err(err);
        }
        self.target.update_collection_current_target(collection_id);
        self.meta
            .put_collection(collection_id, replica_number, load_type)
            .await?;
        info!(
            collection_id,
            replica_number,
            replicas = replicas.len(),
            "collection admitted for loading"
        );
        // first convergence kick; the balancer loop continues from here
        self.balance.balance_collection(collection_id).await;
        Ok(())
    }

    /// Release a collection everywhere and drop its meta, target, and
    /// replicas.
    pub async fn release_collection(&self, collection_id: CollectionId) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        for replica in self.meta.replicas_of(collection_id).await {
            for node_id in replica.node_ids {
                self.actions.submit(Action::ReleaseCollection {
                    node_id,
                    collection_id,
                });
                self.actions.dispatch(node_id).await;
            }
        }
        self.target.remove_collection(collection_id);
        match self.meta.remove_collection(collection_id).await {
            Ok(()) => RpcStatus::success(),
            Err(err) => RpcStatus::from(&err),
        }
    }

    /// Release selected partitions; releasing the last one releases the
    /// collection.
    pub async fn release_partitions(
        &self,
        collection_id: CollectionId,
        partition_ids: Vec<PartitionId>,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        let Some(info) = self.meta.get_collection(collection_id).await else {
            return RpcStatus::success();
        };
        if info.load_type != LoadType::Partition {
            return RpcStatus::error(
                ErrorCode::UnexpectedError,
                "collection was loaded as a whole, release the collection instead",
            );
        }
        for partition_id in &partition_ids {
            if let Err(err) = self.meta.remove_partition(collection_id, *partition_id).await {
                return RpcStatus::from(&err);
            }
        }
        if self.meta.partitions_of(collection_id).await.is_empty() {
            return self.release_collection(collection_id).await;
        }
        for replica in self.meta.replicas_of(collection_id).await {
            for node_id in replica.node_ids {
                self.actions.submit(Action::ReleasePartitions {
                    node_id,
                    collection_id,
                    partition_ids: partition_ids.clone(),
                });
                self.actions.dispatch(node_id).await;
            }
        }
        RpcStatus::success()
    }

    /// Current shard leadership, readable once the collection is loaded.
    pub async fn get_shard_leaders(&self, collection_id: CollectionId) -> GetShardLeadersResponse {
        if !self.is_healthy() {
            return GetShardLeadersResponse {
                status: Self::not_ready(),
                leaders: Vec::new(),
            };
        }
        let Some(info) = self.meta.get_collection(collection_id).await else {
            return GetShardLeadersResponse {
                status: RpcStatus::from(&Error::CollectionNotFound(collection_id)),
                leaders: Vec::new(),
            };
        };
        if info.status != LoadStatus::Loaded {
            return GetShardLeadersResponse {
                status: RpcStatus::error(
                    ErrorCode::NotReady,
                    format!("collection {collection_id} is not loaded"),
                ),
                leaders: Vec::new(),
            };
        }
        let leaders = self
            .target
            .get_channels(collection_id, TargetScope::Current)
            .into_iter()
            .map(|channel| {
                let node_ids = self
                    .dist
                    .leader_views(collection_id)
                    .into_iter()
                    .filter(|view| view.channel == channel.channel_name)
                    .map(|view| view.node_id)
                    .collect();
                ShardLeaders {
                    channel: channel.channel_name,
                    node_ids,
                }
            })
            .collect();
        GetShardLeadersResponse {
            status: RpcStatus::success(),
            leaders,
        }
    }

    /// Make a freshly created partition visible to a loaded collection.
    pub async fn sync_new_created_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        if !self.meta.exist(collection_id).await {
            return RpcStatus::from(&Error::CollectionNotFound(collection_id));
        }
        match self.meta.put_partition(collection_id, partition_id).await {
            Ok(()) => RpcStatus::success(),
            Err(err) => RpcStatus::from(&err),
        }
    }

    /// Operator-triggered move of specific segments off a node.
    pub async fn load_balance(
        &self,
        collection_id: CollectionId,
        src_node: NodeId,
        dst_nodes: Vec<NodeId>,
        segment_ids: Vec<SegmentId>,
    ) -> RpcStatus {
        if !self.is_healthy() {
            return Self::not_ready();
        }
        let Some(info) = self.meta.get_collection(collection_id).await else {
            return RpcStatus::from(&Error::CollectionNotFound(collection_id));
        };
        if info.status != LoadStatus::Loaded {
            return RpcStatus::error(
                ErrorCode::NotReady,
                format!("collection {collection_id} is not loaded"),
            );
        }
        let Some(replica) = self.meta.replica_for_node(collection_id, src_node).await else {
            return RpcStatus::error(
                ErrorCode::UnexpectedError,
                format!("node {src_node} serves no replica of collection {collection_id}"),
            );
        };
        let candidates: Vec<NodeId> = if dst_nodes.is_empty() {
            replica
                .node_ids
                .iter()
                .copied()
                .filter(|n| *n != src_node)
                .collect()
        } else {
            dst_nodes
                .into_iter()
                .filter(|n| replica.contains(*n))
                .collect()
        };
        if candidates.is_empty() {
            return RpcStatus::error(ErrorCode::NoAvailableNode, "no destination in replica");
        }

        for segment_id in segment_ids {
            let Some(segment) = self
                .target
                .get_segment(collection_id, segment_id, TargetScope::Current)
            else {
                continue;
            };
            let dest = candidates
                .iter()
                .copied()
                .min_by_key(|n| self.balance.collection_rows_on_node(collection_id, *n))
                .expect("non-empty candidates");
            self.actions.submit(Action::LoadSegment {
                node_id: dest,
                segment: SegmentLoadInfo {
                    segment,
                    replica_id: replica.id,
                },
            });
            self.actions.submit(Action::ReleaseSegment {
                node_id: src_node,
                collection_id,
                segment_id,
            });
            self.actions.dispatch(dest).await;
            self.actions.dispatch(src_node).await;
        }
        RpcStatus::success()
    }

    pub fn get_component_states(&self) -> ComponentStates {
        ComponentStates {
            node_id: self.config.node_id,
            role: "query-coordinator".to_string(),
            state_code: *self.state.read(),
        }
    }

    pub async fn check_health(&self) -> CheckHealthResponse {
        if !self.is_healthy() {
            return CheckHealthResponse {
                is_healthy: false,
                reasons: vec!["coordinator is not serving".to_string()],
            };
        }
        let mut reasons = Vec::new();
        for node_id in self.actions.worker_ids() {
            if let Some(client) = self.actions.worker(node_id) {
                if let Err(err) = client.get_component_states().await {
                    reasons.push(format!("node {node_id} unreachable: {err}"));
                }
            }
        }
        CheckHealthResponse {
            is_healthy: reasons.is_empty(),
            reasons,
        }
    }

    pub fn show_configurations(&self, pattern: &str) -> Vec<(String, String)> {
        let query = &self.config.query;
        let all = vec![
            (
                "query.dist_pull_interval_ms".to_string(),
                query.dist_pull_interval.as_millis().to_string(),
            ),
            (
                "query.dist_req_timeout_secs".to_string(),
                query.dist_req_timeout.as_secs().to_string(),
            ),
            (
                "query.observer_interval_ms".to_string(),
                query.observer_interval.as_millis().to_string(),
            ),
            (
                "query.load_timeout_secs".to_string(),
                query.load_timeout.as_secs().to_string(),
            ),
            (
                "query.balance_threshold_ratio".to_string(),
                query.balance_threshold_ratio.to_string(),
            ),
        ];
        all.into_iter()
            .filter(|(key, _)| pattern.is_empty() || key.contains(pattern))
            .collect()
    }

    pub async fn get_metrics(&self) -> serde_json::Value {
        let collections = self.meta.collections().await;
        let loaded = collections
            .iter()
            .filter(|c| c.status == LoadStatus::Loaded)
            .count();
        let workers = self.actions.worker_ids();
        let pull_failures: HashMap<NodeId, usize> = workers
            .iter()
            .map(|n| (*n, self.dist.pull_failure_count(*n)))
            .collect();
        serde_json::json!({
            "node_id": self.config.node_id,
            "workers": workers.len(),
            "collections": { "total": collections.len(), "loaded": loaded },
            "dist_pull_failures": pull_failures,
        })
    }
}
