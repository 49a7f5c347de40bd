//! Integration tests for the collection load lifecycle
//!
//! Exercises the query coordinator end to end: load admission, observer-driven
//! convergence to Loaded, shard leader reporting, the load timeout policy,
//! and release.

use lodestone::cluster::{
    LocalDataCoord, LocalQueryWorker, LocalQueryWorkerFactory, SessionManager, ROLE_QUERY_WORKER,
};
use lodestone::config::CoordinatorConfig;
use lodestone::kv::MemoryKv;
use lodestone::querycoord::{LoadStatus, QueryCoordinator};
use lodestone::types::{DmChannel, ErrorCode, SegmentInfo};
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    data_coord: Arc<LocalDataCoord>,
    factory: Arc<LocalQueryWorkerFactory>,
    sessions: SessionManager,
    coordinator: Arc<QueryCoordinator>,
}

async fn cluster_with_timeout(load_timeout: Duration) -> Cluster {
    let kv = Arc::new(MemoryKv::new());
    let data_coord = Arc::new(LocalDataCoord::new());
    let factory = Arc::new(LocalQueryWorkerFactory::new());
    let sessions = SessionManager::new(kv.clone());

    let mut config = CoordinatorConfig::default();
    config.node_id = 1;
    config.query.dist_pull_interval = Duration::from_millis(50);
    config.query.observer_interval = Duration::from_millis(50);
    config.query.balance_interval = Duration::from_millis(100);
    config.query.load_timeout = load_timeout;

    let coordinator = QueryCoordinator::new(config, kv, data_coord.clone(), factory.clone())
        .await
        .unwrap();

    Cluster {
        data_coord,
        factory,
        sessions,
        coordinator,
    }
}

async fn cluster() -> Cluster {
    cluster_with_timeout(Duration::from_secs(600)).await
}

impl Cluster {
    async fn register_worker(&self, node_id: i64) -> Arc<LocalQueryWorker> {
        let worker = Arc::new(LocalQueryWorker::new(node_id));
        self.factory.register(node_id, worker.clone());
        self.sessions
            .register(ROLE_QUERY_WORKER, node_id, &format!("10.0.1.{node_id}:7051"))
            .await
            .unwrap();
        worker
    }

    fn seed_collection(&self, collection_id: i64, segments: &[(i64, i64)]) {
        self.data_coord.add_channel(DmChannel {
            collection_id,
            channel_name: format!("dml_{collection_id}"),
        });
        for (segment_id, num_rows) in segments {
            self.data_coord.add_segment(SegmentInfo {
                segment_id: *segment_id,
                collection_id,
                partition_id: 1,
                insert_channel: format!("dml_{collection_id}"),
                num_rows: *num_rows,
            });
        }
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_load_collection_to_loaded() {
    let cluster = cluster().await;
    cluster.seed_collection(101, &[(1, 100), (2, 200)]);
    cluster.register_worker(1).await;
    cluster.register_worker(2).await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster.coordinator.load_collection(101, 2).await;
    assert!(status.is_success(), "load failed: {}", status.reason);

    let meta = cluster.coordinator.meta();
    wait_for("collection to reach Loaded", || {
        let meta = meta.clone();
        async move {
            meta.get_collection(101)
                .await
                .map(|c| c.status == LoadStatus::Loaded)
                .unwrap_or(false)
        }
    })
    .await;

    let info = meta.get_collection(101).await.unwrap();
    assert_eq!(info.load_percentage, 100);

    // replica invariants hold
    let replicas = meta.replicas_of(101).await;
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].node_ids.len(), 2);

    // loading again is idempotent
    assert!(cluster.coordinator.load_collection(101, 2).await.is_success());

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_shard_leaders_after_load() {
    let cluster = cluster().await;
    cluster.seed_collection(101, &[(1, 100)]);
    cluster.register_worker(1).await;
    cluster.coordinator.start().await.unwrap();

    // not loaded yet: leaders are refused
    let leaders = cluster.coordinator.get_shard_leaders(101).await;
    assert_eq!(leaders.status.error_code, ErrorCode::CollectionNotFound);

    assert!(cluster.coordinator.load_collection(101, 1).await.is_success());

    let coordinator = cluster.coordinator.clone();
    wait_for("shard leaders to appear", || {
        let coordinator = coordinator.clone();
        async move {
            let response = coordinator.get_shard_leaders(101).await;
            response.status.is_success()
                && response.leaders.len() == 1
                && !response.leaders[0].node_ids.is_empty()
        }
    })
    .await;

    let response = cluster.coordinator.get_shard_leaders(101).await;
    assert_eq!(response.leaders[0].channel, "dml_101");
    assert_eq!(response.leaders[0].node_ids, vec![1]);

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_load_timeout_releases_everything() {
    let cluster = cluster_with_timeout(Duration::from_secs(2)).await;
    cluster.seed_collection(101, &[(1, 100)]);

    // the worker exists but never answers, so nothing is ever reported
    let worker = cluster.register_worker(1).await;
    worker.set_offline(true);

    cluster.coordinator.start().await.unwrap();
    assert!(cluster.coordinator.load_collection(101, 1).await.is_success());
    assert!(cluster.coordinator.meta().exist(101).await);

    let meta = cluster.coordinator.meta();
    wait_for("timeout to remove the collection", || {
        let meta = meta.clone();
        async move { !meta.exist(101).await }
    })
    .await;

    assert!(meta.replicas_of(101).await.is_empty());
    assert!(!cluster
        .coordinator
        .target()
        .has_target(101, lodestone::querycoord::TargetScope::Current));

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_release_collection() {
    let cluster = cluster().await;
    cluster.seed_collection(101, &[(1, 100)]);
    let worker = cluster.register_worker(1).await;
    cluster.coordinator.start().await.unwrap();

    assert!(cluster.coordinator.load_collection(101, 1).await.is_success());
    let meta = cluster.coordinator.meta();
    wait_for("collection to reach Loaded", || {
        let meta = meta.clone();
        async move {
            meta.get_collection(101)
                .await
                .map(|c| c.status == LoadStatus::Loaded)
                .unwrap_or(false)
        }
    })
    .await;

    let status = cluster.coordinator.release_collection(101).await;
    assert!(status.is_success());
    assert!(!meta.exist(101).await);

    let worker = worker.clone();
    wait_for("worker to drop its segments", || {
        let worker = worker.clone();
        async move { worker.loaded_segment_count() == 0 }
    })
    .await;

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_load_partitions_and_new_partition_sync() {
    let cluster = cluster().await;
    cluster.seed_collection(101, &[(1, 100)]);
    cluster.register_worker(1).await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster.coordinator.load_partitions(101, vec![1], 1).await;
    assert!(status.is_success(), "load failed: {}", status.reason);
    assert_eq!(cluster.coordinator.meta().partitions_of(101).await.len(), 1);

    let status = cluster.coordinator.sync_new_created_partition(101, 2).await;
    assert!(status.is_success());
    assert_eq!(cluster.coordinator.meta().partitions_of(101).await.len(), 2);

    // releasing every partition releases the collection
    let status = cluster
        .coordinator
        .release_partitions(101, vec![1, 2])
        .await;
    assert!(status.is_success());
    assert!(!cluster.coordinator.meta().exist(101).await);

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_not_enough_nodes_rejected() {
    let cluster = cluster().await;
    cluster.seed_collection(101, &[(1, 100)]);
    cluster.register_worker(1).await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster.coordinator.load_collection(101, 3).await;
    assert!(!status.is_success());
    assert_eq!(status.error_code, ErrorCode::NoAvailableNode);
    assert!(!cluster.coordinator.meta().exist(101).await);

    cluster.coordinator.stop().await;
}
