//! Index worker pool
//!
//! Tracks the build workers known to the coordinator, their health, and the
//! number of in-progress builds on each. Session events from service
//! discovery drive add/remove; a static bind mode registers one hardcoded
//! worker and skips discovery entirely.

use crate::cluster::worker::IndexWorker;
use crate::types::NodeId;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One registered build worker.
pub struct WorkerNode {
    pub node_id: NodeId,
    pub address: String,
    /// Registration ordinal; earlier workers win assignment ties
    pub priority: u64,
    client: Arc<dyn IndexWorker>,
    task_count: AtomicUsize,
    last_heartbeat: Mutex<Instant>,
}

impl WorkerNode {
    pub fn client(&self) -> Arc<dyn IndexWorker> {
        self.client.clone()
    }

    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn inc_task_count(&self) {
        self.task_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_task_count(&self) {
        let mut current = self.task_count.load(Ordering::SeqCst);
        while current > 0 {
            match self.task_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }
}

/// Pool of build workers keyed by node id.
pub struct NodeManager {
    nodes: RwLock<HashMap<NodeId, Arc<WorkerNode>>>,
    next_priority: AtomicU64,
    heartbeat_ttl: Duration,
}

impl NodeManager {
    pub fn new(heartbeat_ttl: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_priority: AtomicU64::new(0),
            heartbeat_ttl,
        }
    }

    /// Register a worker after a successful health ping.
    pub async fn add_node(
        &self,
        node_id: NodeId,
        address: &str,
        client: Arc<dyn IndexWorker>,
    ) -> Result<()> {
        let states = client.get_component_states().await.map_err(|err| {
            warn!(node_id, address, %err, "worker failed health ping, not registering");
            err
        })?;
        if states.state_code != crate::types::StateCode::Healthy {
            return Err(Error::Rpc(format!(
                "worker {node_id} at {address} is not healthy: {:?}",
                states.state_code
            )));
        }

        let node = Arc::new(WorkerNode {
            node_id,
            address: address.to_string(),
            priority: self.next_priority.fetch_add(1, Ordering::SeqCst),
            client,
            task_count: AtomicUsize::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
        });
        self.nodes.write().insert(node_id, node);
        info!(node_id, address, "registered index worker");
        Ok(())
    }

    /// Drop a worker; the caller re-queues its in-progress builds.
    pub fn remove_node(&self, node_id: NodeId) -> Option<Arc<WorkerNode>> {
        let removed = self.nodes.write().remove(&node_id);
        if removed.is_some() {
            info!(node_id, "removed index worker");
        }
        removed
    }

    pub fn get(&self, node_id: NodeId) -> Option<Arc<WorkerNode>> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn all_nodes(&self) -> Vec<Arc<WorkerNode>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// The assignable worker with the fewest in-progress builds; ties go to
    /// the earliest-registered, then lowest node id. Workers whose last
    /// heartbeat is older than the ttl are skipped.
    pub fn pick_node(&self) -> Result<Arc<WorkerNode>> {
        self.nodes
            .read()
            .values()
            .filter(|node| node.heartbeat_age() <= self.heartbeat_ttl)
            .min_by_key(|node| (node.task_count(), node.priority, node.node_id))
            .cloned()
            .ok_or(Error::NoAvailableNode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalIndexWorker;

    async fn manager_with(nodes: &[NodeId]) -> NodeManager {
        let manager = NodeManager::new(Duration::from_secs(30));
        for node_id in nodes {
            manager
                .add_node(
                    *node_id,
                    &format!("10.0.0.{node_id}:7041"),
                    Arc::new(LocalIndexWorker::new(*node_id)),
                )
                .await
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let manager = manager_with(&[10, 11]).await;
        assert_eq!(manager.node_count(), 2);
        assert!(manager.get(10).is_some());

        manager.remove_node(10);
        assert!(manager.get(10).is_none());
        assert_eq!(manager.node_count(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_worker_rejected() {
        let manager = NodeManager::new(Duration::from_secs(30));
        let worker = Arc::new(LocalIndexWorker::new(10));
        worker.set_offline(true);
        assert!(manager.add_node(10, "10.0.0.10:7041", worker).await.is_err());
        assert_eq!(manager.node_count(), 0);
    }

    #[tokio::test]
    async fn test_pick_prefers_least_loaded() {
        let manager = manager_with(&[10, 11]).await;

        // equal load: earliest registration wins
        assert_eq!(manager.pick_node().unwrap().node_id, 10);

        manager.get(10).unwrap().inc_task_count();
        manager.get(10).unwrap().inc_task_count();
        manager.get(11).unwrap().inc_task_count();
        assert_eq!(manager.pick_node().unwrap().node_id, 11);

        manager.get(11).unwrap().dec_task_count();
        manager.get(11).unwrap().dec_task_count(); // saturates at zero
        assert_eq!(manager.get(11).unwrap().task_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let manager = NodeManager::new(Duration::from_secs(30));
        assert!(matches!(manager.pick_node(), Err(Error::NoAvailableNode)));
    }

    #[tokio::test]
    async fn test_stale_heartbeat_excluded() {
        let manager = NodeManager::new(Duration::ZERO);
        manager
            .add_node(10, "10.0.0.10:7041", Arc::new(LocalIndexWorker::new(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(manager.pick_node(), Err(Error::NoAvailableNode)));

        manager.get(10).unwrap().mark_heartbeat();
        // still zero ttl, but a fresh heartbeat within the same instant may pass;
        // use a real ttl for the positive case
        let manager = manager_with(&[10]).await;
        assert!(manager.pick_node().is_ok());
    }
}
