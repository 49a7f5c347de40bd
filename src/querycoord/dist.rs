//! Observed worker distributions
//!
//! DistributionManager keeps the last snapshot each query worker reported:
//! its sealed segments, subscribed channels, and leader views. `update`
//! replaces a node's slice atomically behind an `Arc`, so readers never block
//! writers. DistHandler is the per-worker pull loop feeding it.

use crate::cluster::worker::{
    ChannelReport, DataDistribution, QueryWorker, SegmentReport, SegmentVersion,
};
use crate::querycoord::task::ActionScheduler;
use crate::types::{CollectionId, NodeId, SegmentId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive pull failures before the handler logs loudly. Session events
/// stay authoritative for membership; the handler never removes the node.
const MAX_PULL_FAILURES: usize = 3;

/// A worker's self-reported summary of one shard it leads.
#[derive(Debug, Clone)]
pub struct LeaderView {
    pub node_id: NodeId,
    pub collection_id: CollectionId,
    pub channel: String,
    pub sealed_segments: HashMap<SegmentId, SegmentVersion>,
    pub growing_segments: HashMap<SegmentId, i64>,
}

#[derive(Default)]
struct NodeDistribution {
    segments: Arc<Vec<SegmentReport>>,
    channels: Arc<Vec<ChannelReport>>,
    leader_views: Arc<Vec<LeaderView>>,
    heartbeat: Option<Instant>,
}

#[derive(Default)]
pub struct DistributionManager {
    nodes: RwLock<HashMap<NodeId, NodeDistribution>>,
    /// consecutive pull failures per node, surfaced in metrics
    pull_failures: RwLock<HashMap<NodeId, Arc<AtomicUsize>>>,
}

impl DistributionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything node `node_id` last reported, atomically.
    pub fn update(&self, node_id: NodeId, dist: DataDistribution) {
        let leader_views = dist
            .leader_views
            .into_iter()
            .map(|view| LeaderView {
                node_id,
                collection_id: view.collection_id,
                channel: view.channel,
                sealed_segments: view.sealed_segments,
                growing_segments: view.growing_segments,
            })
            .collect();
        let mut nodes = self.nodes.write();
        nodes.insert(
            node_id,
            NodeDistribution {
                segments: Arc::new(dist.segments),
                channels: Arc::new(dist.channels),
                leader_views: Arc::new(leader_views),
                heartbeat: Some(Instant::now()),
            },
        );
    }

    pub fn remove_node(&self, node_id: NodeId) {
        self.nodes.write().remove(&node_id);
        self.pull_failures.write().remove(&node_id);
    }

    pub fn segments_on_node(&self, node_id: NodeId) -> Vec<SegmentReport> {
        self.nodes
            .read()
            .get(&node_id)
            .map(|d| d.segments.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn channels_on_node(&self, node_id: NodeId) -> Vec<ChannelReport> {
        self.nodes
            .read()
            .get(&node_id)
            .map(|d| d.channels.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn node_has_segment(&self, node_id: NodeId, segment_id: SegmentId) -> bool {
        self.nodes
            .read()
            .get(&node_id)
            .map(|d| d.segments.iter().any(|s| s.segment_id == segment_id))
            .unwrap_or(false)
    }

    pub fn node_has_channel(&self, node_id: NodeId, channel: &str) -> bool {
        self.nodes
            .read()
            .get(&node_id)
            .map(|d| d.channels.iter().any(|c| c.channel_name == channel))
            .unwrap_or(false)
    }

    /// Version a node last reported for one of its segments.
    pub fn segment_version(&self, node_id: NodeId, segment_id: SegmentId) -> Option<i64> {
        self.nodes
            .read()
            .get(&node_id)?
            .segments
            .iter()
            .find(|s| s.segment_id == segment_id)
            .map(|s| s.version)
    }

    /// Nodes currently holding a segment of the collection, across all
    /// reports.
    pub fn segment_nodes(&self, collection_id: CollectionId, segment_id: SegmentId) -> Vec<NodeId> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, d)| {
                d.segments
                    .iter()
                    .any(|s| s.collection_id == collection_id && s.segment_id == segment_id)
            })
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    /// Union of all leader views for a collection.
    pub fn leader_views(&self, collection_id: CollectionId) -> Vec<LeaderView> {
        self.nodes
            .read()
            .values()
            .flat_map(|d| d.leader_views.iter().cloned())
            .filter(|view| view.collection_id == collection_id)
            .collect()
    }

    pub fn leader_of_channel(&self, collection_id: CollectionId, channel: &str) -> Option<LeaderView> {
        self.nodes
            .read()
            .values()
            .flat_map(|d| d.leader_views.iter())
            .find(|view| view.collection_id == collection_id && view.channel == channel)
            .cloned()
    }

    pub fn heartbeat_age(&self, node_id: NodeId) -> Option<Duration> {
        self.nodes
            .read()
            .get(&node_id)
            .and_then(|d| d.heartbeat)
            .map(|h| h.elapsed())
    }

    fn failure_counter(&self, node_id: NodeId) -> Arc<AtomicUsize> {
        self.pull_failures
            .write()
            .entry(node_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    pub fn pull_failure_count(&self, node_id: NodeId) -> usize {
        self.pull_failures
            .read()
            .get(&node_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Pulls one worker's distribution on a fixed interval.
pub struct DistHandler {
    node_id: NodeId,
    client: Arc<dyn QueryWorker>,
    dist: Arc<DistributionManager>,
    actions: Arc<ActionScheduler>,
    pull_interval: Duration,
    req_timeout: Duration,
}

impl DistHandler {
    pub fn new(
        node_id: NodeId,
        client: Arc<dyn QueryWorker>,
        dist: Arc<DistributionManager>,
        actions: Arc<ActionScheduler>,
        pull_interval: Duration,
        req_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            client,
            dist,
            actions,
            pull_interval,
            req_timeout,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let failures = self.dist.failure_counter(self.node_id);
        let mut ticker = tokio::time::interval(self.pull_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node_id = self.node_id, "dist handler started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(node_id = self.node_id, "dist handler stopped");
                    return;
                }
                _ = ticker.tick() => self.pull_once(&failures).await,
            }
        }
    }

    /// One pull. Public for deterministic tests.
    pub async fn pull_once(&self, failures: &AtomicUsize) {
        let pulled = tokio::time::timeout(self.req_timeout, self.client.get_data_distribution())
            .await
            .map_err(|_| crate::Error::Timeout)
            .and_then(|r| r);

        match pulled {
            Ok(distribution) => {
                failures.store(0, Ordering::SeqCst);
                self.dist.update(self.node_id, distribution);
                // flush whatever the coordinator queued for this worker
                self.actions.dispatch(self.node_id).await;
            }
            Err(err) => {
                let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(node_id = self.node_id, %err, "distribution pull failed");
                if count >= MAX_PULL_FAILURES {
                    warn!(
                        node_id = self.node_id,
                        failures = count,
                        "repeated distribution pull failures; waiting for session events"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::worker::{LeaderViewReport, SegmentLoadInfo};
    use crate::cluster::{LocalQueryWorker, QueryWorker};
    use crate::types::{DmChannel, SegmentInfo};

    fn report(segment_id: SegmentId, rows: i64) -> SegmentReport {
        SegmentReport {
            segment_id,
            collection_id: 101,
            partition_id: 1,
            channel: "dml_0".to_string(),
            num_rows: rows,
            version: 1,
        }
    }

    #[test]
    fn test_update_replaces_whole_slice() {
        let dist = DistributionManager::new();
        dist.update(
            1,
            DataDistribution {
                segments: vec![report(5, 10), report(6, 10)],
                channels: vec![],
                leader_views: vec![],
            },
        );
        assert_eq!(dist.segments_on_node(1).len(), 2);
        assert!(dist.node_has_segment(1, 5));

        dist.update(
            1,
            DataDistribution {
                segments: vec![report(6, 10)],
                channels: vec![],
                leader_views: vec![],
            },
        );
        assert_eq!(dist.segments_on_node(1).len(), 1);
        assert!(!dist.node_has_segment(1, 5));

        dist.remove_node(1);
        assert!(dist.segments_on_node(1).is_empty());
    }

    #[test]
    fn test_union_lookups_across_nodes() {
        let dist = DistributionManager::new();
        dist.update(
            1,
            DataDistribution {
                segments: vec![report(5, 10)],
                channels: vec![],
                leader_views: vec![LeaderViewReport {
                    collection_id: 101,
                    channel: "dml_0".to_string(),
                    sealed_segments: HashMap::new(),
                    growing_segments: HashMap::new(),
                }],
            },
        );
        dist.update(
            2,
            DataDistribution {
                segments: vec![report(5, 10)],
                channels: vec![],
                leader_views: vec![],
            },
        );

        let mut nodes = dist.segment_nodes(101, 5);
        nodes.sort_unstable();
        assert_eq!(nodes, vec![1, 2]);
        assert_eq!(dist.leader_views(101).len(), 1);
        assert!(dist.leader_of_channel(101, "dml_0").is_some());
        assert!(dist.leader_of_channel(101, "dml_1").is_none());
    }

    #[tokio::test]
    async fn test_dist_handler_pull_and_failure_count() {
        let worker = Arc::new(LocalQueryWorker::new(1));
        worker
            .watch_dm_channels(DmChannel {
                collection_id: 101,
                channel_name: "dml_0".to_string(),
            })
            .await
            .unwrap();
        worker
            .load_segments(vec![SegmentLoadInfo {
                segment: SegmentInfo {
                    segment_id: 5,
                    collection_id: 101,
                    partition_id: 1,
                    insert_channel: "dml_0".to_string(),
                    num_rows: 10,
                },
                replica_id: 1,
            }])
            .await
            .unwrap();

        let dist = Arc::new(DistributionManager::new());
        let actions = Arc::new(ActionScheduler::new(3));
        let handler = DistHandler::new(
            1,
            worker.clone(),
            dist.clone(),
            actions,
            Duration::from_millis(500),
            Duration::from_secs(3),
        );

        let failures = dist.failure_counter(1);
        handler.pull_once(&failures).await;
        assert!(dist.node_has_segment(1, 5));
        assert!(dist.node_has_channel(1, "dml_0"));
        assert_eq!(dist.pull_failure_count(1), 0);

        worker.set_offline(true);
        for _ in 0..MAX_PULL_FAILURES {
            handler.pull_once(&failures).await;
        }
        assert_eq!(dist.pull_failure_count(1), MAX_PULL_FAILURES);
        // the node's last good snapshot is kept; membership is session-driven
        assert!(dist.node_has_segment(1, 5));

        worker.set_offline(false);
        handler.pull_once(&failures).await;
        assert_eq!(dist.pull_failure_count(1), 0);
    }
}
