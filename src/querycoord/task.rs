//! Worker action queues
//!
//! Observers, the balancer, and the load/release flows submit actions here;
//! each worker has its own FIFO drained by `dispatch`, which the worker's
//! dist handler calls after every successful pull. Failed actions are
//! requeued up to a bounded attempt count and then dropped; the observers
//! re-derive anything still missing on a later tick.

use crate::cluster::worker::{QueryWorker, SegmentLoadInfo, SyncDistributionRequest};
use crate::types::{CollectionId, DmChannel, NodeId, PartitionId, SegmentId};
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// One unit of work for a query worker.
#[derive(Debug, Clone)]
pub enum Action {
    LoadSegment {
        node_id: NodeId,
        segment: SegmentLoadInfo,
    },
    ReleaseSegment {
        node_id: NodeId,
        collection_id: CollectionId,
        segment_id: SegmentId,
    },
    SubscribeChannel {
        node_id: NodeId,
        channel: DmChannel,
    },
    UnsubChannel {
        node_id: NodeId,
        collection_id: CollectionId,
        channel: String,
    },
    SyncDistribution {
        node_id: NodeId,
        request: SyncDistributionRequest,
    },
    ReleaseCollection {
        node_id: NodeId,
        collection_id: CollectionId,
    },
    ReleasePartitions {
        node_id: NodeId,
        collection_id: CollectionId,
        partition_ids: Vec<PartitionId>,
    },
    SyncReplicaSegments {
        node_id: NodeId,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    },
}

impl Action {
    pub fn node_id(&self) -> NodeId {
        match self {
            Action::LoadSegment { node_id, .. }
            | Action::ReleaseSegment { node_id, .. }
            | Action::SubscribeChannel { node_id, .. }
            | Action::UnsubChannel { node_id, .. }
            | Action::SyncDistribution { node_id, .. }
            | Action::ReleaseCollection { node_id, .. }
            | Action::ReleasePartitions { node_id, .. }
            | Action::SyncReplicaSegments { node_id, .. } => *node_id,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Action::LoadSegment { .. } => "LoadSegment",
            Action::ReleaseSegment { .. } => "ReleaseSegment",
            Action::SubscribeChannel { .. } => "SubscribeChannel",
            Action::UnsubChannel { .. } => "UnsubChannel",
            Action::SyncDistribution { .. } => "SyncDistribution",
            Action::ReleaseCollection { .. } => "ReleaseCollection",
            Action::ReleasePartitions { .. } => "ReleasePartitions",
            Action::SyncReplicaSegments { .. } => "SyncReplicaSegments",
        }
    }
}

/// Per-node FIFO queues of outstanding actions.
pub struct ActionScheduler {
    workers: DashMap<NodeId, Arc<dyn QueryWorker>>,
    queues: Mutex<HashMap<NodeId, VecDeque<(Action, usize)>>>,
    retry_limit: usize,
}

impl ActionScheduler {
    pub fn new(retry_limit: usize) -> Self {
        Self {
            workers: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            retry_limit,
        }
    }

    pub fn register_worker(&self, node_id: NodeId, client: Arc<dyn QueryWorker>) {
        self.workers.insert(node_id, client);
    }

    pub fn remove_worker(&self, node_id: NodeId) {
        self.workers.remove(&node_id);
        self.queues.lock().remove(&node_id);
    }

    pub fn worker(&self, node_id: NodeId) -> Option<Arc<dyn QueryWorker>> {
        self.workers.get(&node_id).map(|w| w.value().clone())
    }

    pub fn worker_ids(&self) -> Vec<NodeId> {
        self.workers.iter().map(|e| *e.key()).collect()
    }

    /// Queue an action for its target node.
    pub fn submit(&self, action: Action) {
        debug!(node_id = action.node_id(), action = action.describe(), "action queued");
        self.queues
            .lock()
            .entry(action.node_id())
            .or_default()
            .push_back((action, 0));
    }

    /// Whether a load of this segment is already queued anywhere. Keeps the
    /// balancer from planning the same placement twice while the worker's
    /// next distribution report is in flight.
    pub fn is_load_pending(&self, segment_id: SegmentId) -> bool {
        self.queues.lock().values().any(|queue| {
            queue.iter().any(|(action, _)| {
                matches!(action, Action::LoadSegment { segment, .. }
                    if segment.segment.segment_id == segment_id)
            })
        })
    }

    pub fn pending_count(&self, node_id: NodeId) -> usize {
        self.queues
            .lock()
            .get(&node_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drain one node's queue through its client. Failures requeue until the
    /// attempt limit.
    pub async fn dispatch(&self, node_id: NodeId) {
        let Some(client) = self.worker(node_id) else {
            return;
        };
        loop {
            let Some((action, attempts)) = self.queues.lock().get_mut(&node_id).and_then(|q| q.pop_front())
            else {
                return;
            };
            if let Err(err) = Self::apply(&client, &action).await {
                if attempts + 1 >= self.retry_limit {
                    warn!(node_id, action = action.describe(), %err, "action dropped after retries");
                } else {
                    debug!(node_id, action = action.describe(), %err, "action failed, requeueing");
                    self.queues
                        .lock()
                        .entry(node_id)
                        .or_default()
                        .push_back((action, attempts + 1));
                }
                // stop draining on failure; the next dispatch retries
                return;
            }
        }
    }

    async fn apply(client: &Arc<dyn QueryWorker>, action: &Action) -> Result<()> {
        match action {
            Action::LoadSegment { segment, .. } => {
                client.load_segments(vec![segment.clone()]).await
            }
            Action::ReleaseSegment {
                collection_id,
                segment_id,
                ..
            } => client.release_segments(*collection_id, &[*segment_id]).await,
            Action::SubscribeChannel { channel, .. } => {
                client.watch_dm_channels(channel.clone()).await
            }
            Action::UnsubChannel {
                collection_id,
                channel,
                ..
            } => client.unsub_dm_channel(*collection_id, channel).await,
            Action::SyncDistribution { request, .. } => {
                client.sync_distribution(request.clone()).await
            }
            Action::ReleaseCollection { collection_id, .. } => {
                client.release_collection(*collection_id).await
            }
            Action::ReleasePartitions {
                collection_id,
                partition_ids,
                ..
            } => {
                client
                    .release_partitions(*collection_id, partition_ids)
                    .await
            }
            Action::SyncReplicaSegments {
                collection_id,
                segment_ids,
                ..
            } => {
                client
                    .sync_replica_segments(*collection_id, segment_ids)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalQueryWorker;
    use crate::types::SegmentInfo;

    fn load_action(node_id: NodeId, segment_id: SegmentId) -> Action {
        Action::LoadSegment {
            node_id,
            segment: SegmentLoadInfo {
                segment: SegmentInfo {
                    segment_id,
                    collection_id: 101,
                    partition_id: 1,
                    insert_channel: "dml_0".to_string(),
                    num_rows: 10,
                },
                replica_id: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_dispatch_applies_queued_actions() {
        let scheduler = ActionScheduler::new(3);
        let worker = Arc::new(LocalQueryWorker::new(1));
        scheduler.register_worker(1, worker.clone());

        scheduler.submit(load_action(1, 5));
        scheduler.submit(load_action(1, 6));
        assert_eq!(scheduler.pending_count(1), 2);

        scheduler.dispatch(1).await;
        assert_eq!(scheduler.pending_count(1), 0);
        assert_eq!(worker.loaded_segment_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_action_requeued_then_dropped() {
        let scheduler = ActionScheduler::new(2);
        let worker = Arc::new(LocalQueryWorker::new(1));
        worker.set_offline(true);
        scheduler.register_worker(1, worker.clone());

        scheduler.submit(load_action(1, 5));
        scheduler.dispatch(1).await;
        assert_eq!(scheduler.pending_count(1), 1, "first failure requeues");
        scheduler.dispatch(1).await;
        assert_eq!(scheduler.pending_count(1), 0, "second failure drops");
    }

    #[tokio::test]
    async fn test_unknown_node_keeps_queue() {
        let scheduler = ActionScheduler::new(3);
        scheduler.submit(load_action(9, 5));
        scheduler.dispatch(9).await;
        assert_eq!(scheduler.pending_count(9), 1);
    }
}
