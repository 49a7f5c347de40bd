//! Convergence observers
//!
//! CollectionObserver drives the load lifecycle: it recomputes each Loading
//! collection's effective load percentage from the target and distribution
//! managers, persists progress, flips to Loaded at 100 %, and enforces the
//! load timeout by tearing the collection down. LeaderObserver reconciles
//! every reported leader view against the Current target with
//! SyncDistribution actions.

use crate::clock::BoundedClock;
use crate::cluster::worker::{SyncAction, SyncDistributionRequest};
use crate::querycoord::dist::DistributionManager;
use crate::querycoord::meta::{LoadStatus, Meta};
use crate::querycoord::target::{TargetManager, TargetScope};
use crate::querycoord::task::{Action, ActionScheduler};
use crate::types::CollectionId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CollectionObserver {
    meta: Arc<Meta>,
    target: Arc<TargetManager>,
    dist: Arc<DistributionManager>,
    actions: Arc<ActionScheduler>,
    clock: Arc<BoundedClock>,
    interval: Duration,
    load_timeout: Duration,
}

impl CollectionObserver {
    pub fn new(
        meta: Arc<Meta>,
        target: Arc<TargetManager>,
        dist: Arc<DistributionManager>,
        actions: Arc<ActionScheduler>,
        clock: Arc<BoundedClock>,
        interval: Duration,
        load_timeout: Duration,
    ) -> Self {
        Self {
            meta,
            target,
            dist,
            actions,
            clock,
            interval,
            load_timeout,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("collection observer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("collection observer stopped");
                    return;
                }
                _ = ticker.tick() => self.observe().await,
            }
        }
    }

    /// One pass over every Loading collection. Public for deterministic
    /// tests.
    pub async fn observe(&self) {
        for info in self.meta.collections().await {
            if info.status != LoadStatus::Loading {
                continue;
            }
            let elapsed = self.clock.now_nanos() - info.created_at;
            if elapsed >= self.load_timeout.as_nanos() as i64 {
                warn!(
                    collection_id = info.collection_id,
                    load_percentage = info.load_percentage,
                    "load timed out, releasing collection"
                );
                self.teardown(info.collection_id).await;
                continue;
            }

            let percentage = self.load_percentage(info.collection_id).await;
            if percentage == info.load_percentage && percentage < 100 {
                continue;
            }
            match self
                .meta
                .update_load_percentage(info.collection_id, percentage)
                .await
            {
                Ok(updated) if updated.status == LoadStatus::Loaded => {
                    // adopt any refresh staged while loading
                    self.target.update_collection_current_target(info.collection_id);
                    self.announce_replica_segments(info.collection_id).await;
                    info!(collection_id = info.collection_id, "collection loaded");
                }
                Ok(_) => {
                    debug!(
                        collection_id = info.collection_id,
                        percentage, "load progress"
                    );
                }
                Err(err) => warn!(
                    collection_id = info.collection_id,
                    %err,
                    "failed to persist load progress"
                ),
            }
        }
    }

    /// Effective load percentage: the fraction of Current-target segments
    /// present on every replica, gated on channel subscriptions. Partition
    /// loads only count segments of the loaded partitions.
    async fn load_percentage(&self, collection_id: CollectionId) -> i32 {
        let replicas = self.meta.replicas_of(collection_id).await;
        if replicas.is_empty() {
            return 0;
        }
        let partition_filter = match self.meta.get_collection(collection_id).await {
            Some(info) if info.load_type == crate::querycoord::meta::LoadType::Partition => Some(
                self.meta
                    .partitions_of(collection_id)
                    .await
                    .into_iter()
                    .map(|p| p.partition_id)
                    .collect::<std::collections::HashSet<_>>(),
            ),
            Some(_) => None,
            None => return 0,
        };
        let segments: Vec<_> = self
            .target
            .get_segments(collection_id, TargetScope::Current)
            .into_iter()
            .filter(|s| {
                partition_filter
                    .as_ref()
                    .map(|set| set.contains(&s.partition_id))
                    .unwrap_or(true)
            })
            .collect();
        let channels = self.target.get_channels(collection_id, TargetScope::Current);

        let channels_ready = channels.iter().all(|channel| {
            replicas.iter().all(|replica| {
                replica
                    .node_ids
                    .iter()
                    .any(|node| self.dist.node_has_channel(*node, &channel.channel_name))
            })
        });

        if segments.is_empty() {
            return if !channels.is_empty() && channels_ready { 100 } else { 0 };
        }

        let loaded = segments
            .iter()
            .filter(|segment| {
                replicas.iter().all(|replica| {
                    replica
                        .node_ids
                        .iter()
                        .any(|node| self.dist.node_has_segment(*node, segment.segment_id))
                })
            })
            .count();

        let mut percentage = (loaded * 100 / segments.len()) as i32;
        if percentage == 100 && !channels_ready {
            // all rows served but a shard has no subscriber yet
            percentage = 99;
        }
        percentage
    }

    /// Tell every replica member which sealed segments its group now serves.
    async fn announce_replica_segments(&self, collection_id: CollectionId) {
        for replica in self.meta.replicas_of(collection_id).await {
            let segment_ids: Vec<_> = self
                .target
                .get_segments(collection_id, TargetScope::Current)
                .into_iter()
                .map(|s| s.segment_id)
                .collect();
            for node_id in replica.node_ids {
                self.actions.submit(Action::SyncReplicaSegments {
                    node_id,
                    collection_id,
                    segment_ids: segment_ids.clone(),
                });
                self.actions.dispatch(node_id).await;
            }
        }
    }

    /// Timeout policy: release the workers, then drop replicas, target, and
    /// meta.
    async fn teardown(&self, collection_id: CollectionId) {
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
        if let Err(err) = self.meta.remove_collection(collection_id).await {
            warn!(collection_id, %err, "failed to remove collection meta");
        }
    }
}

pub struct LeaderObserver {
    meta: Arc<Meta>,
    target: Arc<TargetManager>,
    dist: Arc<DistributionManager>,
    actions: Arc<ActionScheduler>,
    interval: Duration,
}

impl LeaderObserver {
    pub fn new(
        meta: Arc<Meta>,
        target: Arc<TargetManager>,
        dist: Arc<DistributionManager>,
        actions: Arc<ActionScheduler>,
        interval: Duration,
    ) -> Self {
        Self {
            meta,
            target,
            dist,
            actions,
            interval,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("leader observer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("leader observer stopped");
                    return;
                }
                _ = ticker.tick() => self.observe().await,
            }
        }
    }

    /// Reconcile every reported leader view once. Public for deterministic
    /// tests.
    pub async fn observe(&self) {
        for info in self.meta.collections().await {
            for view in self.dist.leader_views(info.collection_id) {
                let Some(replica) = self
                    .meta
                    .replica_for_node(info.collection_id, view.node_id)
                    .await
                else {
                    continue;
                };

                let mut sync_actions = Vec::new();

                // segments the leader should serve but doesn't
                for segment in self
                    .target
                    .get_segments(info.collection_id, TargetScope::Current)
                {
                    if segment.insert_channel != view.channel
                        || view.sealed_segments.contains_key(&segment.segment_id)
                    {
                        continue;
                    }
                    let Some(holder) = self
                        .dist
                        .segment_nodes(info.collection_id, segment.segment_id)
                        .into_iter()
                        .find(|node| replica.contains(*node))
                    else {
                        continue;
                    };
                    let version = self
                        .dist
                        .segment_version(holder, segment.segment_id)
                        .unwrap_or(0);
                    sync_actions.push(SyncAction::Set {
                        segment_id: segment.segment_id,
                        node_id: holder,
                        version,
                    });
                }

                // segments the leader serves but neither target knows
                for segment_id in view.sealed_segments.keys() {
                    let in_current = self
                        .target
                        .get_segment(info.collection_id, *segment_id, TargetScope::Current)
                        .is_some();
                    let in_next = self
                        .target
                        .get_segment(info.collection_id, *segment_id, TargetScope::Next)
                        .is_some();
                    if !in_current && !in_next {
                        sync_actions.push(SyncAction::Remove {
                            segment_id: *segment_id,
                        });
                    }
                }

                if !sync_actions.is_empty() {
                    debug!(
                        collection_id = info.collection_id,
                        leader = view.node_id,
                        channel = %view.channel,
                        actions = sync_actions.len(),
                        "syncing leader view"
                    );
                    self.actions.submit(Action::SyncDistribution {
                        node_id: view.node_id,
                        request: SyncDistributionRequest {
                            collection_id: info.collection_id,
                            channel: view.channel.clone(),
                            actions: sync_actions,
                        },
                    });
                    self.actions.dispatch(view.node_id).await;
                }
            }
        }
    }
}
