//! Integration tests for the index build lifecycle
//!
//! Exercises the index coordinator end to end against the in-memory store
//! and in-process workers: create, build, fail over, conflict, drop, and
//! garbage collection.

use lodestone::clock::BoundedClock;
use lodestone::cluster::{
    LocalDataCoord, LocalIndexWorker, LocalIndexWorkerFactory, SessionManager, ROLE_INDEX_WORKER,
};
use lodestone::config::CoordinatorConfig;
use lodestone::indexcoord::gc::GarbageCollector;
use lodestone::cluster::IndexWorker;
use lodestone::indexcoord::{CreateIndexRequest, IndexCoordinator};
use lodestone::kv::{MemoryKv, MetaKv};
use lodestone::types::{ErrorCode, IndexState, SegmentInfo};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    kv: Arc<MemoryKv>,
    store: Arc<InMemory>,
    data_coord: Arc<LocalDataCoord>,
    factory: Arc<LocalIndexWorkerFactory>,
    sessions: SessionManager,
    coordinator: Arc<IndexCoordinator>,
}

async fn cluster() -> Cluster {
    let kv = Arc::new(MemoryKv::new());
    let store = Arc::new(InMemory::new());
    let data_coord = Arc::new(LocalDataCoord::new());
    let factory = Arc::new(LocalIndexWorkerFactory::new());
    let sessions = SessionManager::new(kv.clone());

    let mut config = CoordinatorConfig::default();
    config.node_id = 1;
    config.index.builder_tick_interval = Duration::from_millis(20);

    let coordinator = IndexCoordinator::new(
        config,
        kv.clone(),
        store.clone(),
        data_coord.clone(),
        factory.clone(),
    )
    .await
    .unwrap();

    Cluster {
        kv,
        store,
        data_coord,
        factory,
        sessions,
        coordinator,
    }
}

impl Cluster {
    async fn register_worker(&self, worker: Arc<LocalIndexWorker>, node_id: i64) {
        self.factory.register(node_id, worker);
        self.sessions
            .register(ROLE_INDEX_WORKER, node_id, &format!("10.0.0.{node_id}:7041"))
            .await
            .unwrap();
    }

    fn add_flushed_segment(&self, segment_id: i64, num_rows: i64) -> SegmentInfo {
        let segment = SegmentInfo {
            segment_id,
            collection_id: 100,
            partition_id: 1,
            insert_channel: "dml_0".to_string(),
            num_rows,
        };
        self.data_coord.add_segment(segment.clone());
        segment
    }
}

fn vec_idx_request(params: &[(&str, &str)]) -> CreateIndexRequest {
    let mut index_params = BTreeMap::new();
    for (key, value) in params {
        index_params.insert(key.to_string(), value.to_string());
    }
    CreateIndexRequest {
        collection_id: 100,
        field_id: 2,
        index_name: "vec_idx".to_string(),
        type_params: BTreeMap::new(),
        index_params,
        alternate: false,
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_happy_path_build() {
    let cluster = cluster().await;
    cluster.add_flushed_segment(1, 1000);
    cluster.add_flushed_segment(2, 500);

    let worker_a = Arc::new(LocalIndexWorker::new(10).with_object_store(cluster.store.clone()));
    let worker_b = Arc::new(LocalIndexWorker::new(11).with_object_store(cluster.store.clone()));
    cluster.register_worker(worker_a.clone(), 10).await;
    cluster.register_worker(worker_b.clone(), 11).await;

    cluster.coordinator.start().await.unwrap();

    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success(), "create failed: {}", status.reason);

    let coordinator = cluster.coordinator.clone();
    wait_for("both builds to finish", || {
        let coordinator = coordinator.clone();
        async move {
            let progress = coordinator.get_index_build_progress(100, "vec_idx").await;
            progress.status.is_success() && progress.indexed_rows == progress.total_rows
                && progress.total_rows == 1500
        }
    })
    .await;

    let state = cluster.coordinator.get_index_state(100, "vec_idx").await;
    assert!(state.status.is_success());
    assert_eq!(state.state, IndexState::Finished);

    // least-loaded assignment spread one build per worker
    let stats_a = worker_a.get_job_stats().await.unwrap();
    let stats_b = worker_b.get_job_stats().await.unwrap();
    assert_eq!(stats_a.finished, 1, "worker 10 should build one segment");
    assert_eq!(stats_b.finished, 1, "worker 11 should build one segment");

    // artifact descriptors are visible per segment
    let infos = cluster
        .coordinator
        .get_index_infos(100, &[1, 2], "vec_idx")
        .await;
    assert!(infos.status.is_success());
    for segment_id in [1, 2] {
        let per_segment = &infos.infos[&segment_id];
        assert_eq!(per_segment.len(), 1);
        assert!(!per_segment[0].file_keys.is_empty());
    }

    // all segment reference locks were released
    assert_eq!(cluster.data_coord.held_lock_count(), 0);

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_node_down_mid_build() {
    let cluster = cluster().await;
    cluster.add_flushed_segment(1, 1000);

    // the first worker accepts the job but never finishes it
    let stuck = Arc::new(LocalIndexWorker::new(10).with_build_delay(Duration::from_secs(3600)));
    cluster.register_worker(stuck, 10).await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success());

    let meta = cluster.coordinator.meta();
    wait_for("assignment to node 10", || {
        let meta = meta.clone();
        async move { meta.in_progress_on_node(10).await == 1 }
    })
    .await;

    // session delete fires for node 10
    cluster.sessions.revoke(ROLE_INDEX_WORKER, 10).await.unwrap();

    // a healthy node joins and the build is reassigned to it
    let replacement = Arc::new(LocalIndexWorker::new(11));
    cluster.register_worker(replacement.clone(), 11).await;

    let coordinator = cluster.coordinator.clone();
    wait_for("build to finish on node 11", || {
        let coordinator = coordinator.clone();
        async move {
            let state = coordinator.get_index_state(100, "vec_idx").await;
            state.state == IndexState::Finished
        }
    })
    .await;
    assert_eq!(replacement.get_job_stats().await.unwrap().finished, 1);

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_duplicate_index_name_conflict() {
    let cluster = cluster().await;
    cluster.add_flushed_segment(1, 10);
    cluster
        .register_worker(Arc::new(LocalIndexWorker::new(10)), 10)
        .await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success());

    // identical request is idempotent
    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success());

    // same name with different params conflicts
    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "HNSW")]))
        .await;
    assert!(!status.is_success());
    assert!(
        status.reason.contains("index already exists"),
        "unexpected reason: {}",
        status.reason
    );

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_drop_propagates_to_gc() {
    let cluster = cluster().await;
    cluster.add_flushed_segment(1, 100);
    let worker = Arc::new(LocalIndexWorker::new(10).with_object_store(cluster.store.clone()));
    cluster.register_worker(worker, 10).await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success());

    let coordinator = cluster.coordinator.clone();
    wait_for("build to finish", || {
        let coordinator = coordinator.clone();
        async move {
            coordinator.get_index_state(100, "vec_idx").await.state == IndexState::Finished
        }
    })
    .await;

    let meta = cluster.coordinator.meta();
    let index_id = meta.get_index_by_name(100, "vec_idx").await.unwrap().index_id;
    let build_id = meta.has_same_index(1, index_id).await.unwrap();
    let artifact_prefix = Path::from(format!("index-files/{build_id}"));
    let files_before: Vec<_> = {
        use futures::StreamExt;
        cluster
            .store
            .list(Some(&artifact_prefix))
            .collect::<Vec<_>>()
            .await
    };
    assert!(!files_before.is_empty(), "build should have written artifacts");

    let status = cluster.coordinator.drop_index(100, vec![], "vec_idx", true).await;
    assert!(status.is_success());

    let state = cluster.coordinator.get_index_state(100, "vec_idx").await;
    assert_eq!(state.status.error_code, ErrorCode::IndexNotExist);

    // a sweep removes rows and artifact files
    let gc = GarbageCollector::new(
        meta.clone(),
        cluster.store.clone(),
        cluster.data_coord.clone(),
        Arc::new(BoundedClock::default()),
        CoordinatorConfig::default().index,
    );
    gc.sweep().await;

    assert!(meta.get_segment_index(build_id).await.is_none());
    let files_after: Vec<_> = {
        use futures::StreamExt;
        cluster
            .store
            .list(Some(&artifact_prefix))
            .collect::<Vec<_>>()
            .await
    };
    assert!(files_after.is_empty(), "artifacts should be gone after GC");

    cluster.coordinator.stop().await;
}

#[tokio::test]
async fn test_flushed_segment_event_triggers_build() {
    let cluster = cluster().await;
    cluster
        .register_worker(Arc::new(LocalIndexWorker::new(10)), 10)
        .await;
    cluster.coordinator.start().await.unwrap();

    let status = cluster
        .coordinator
        .create_index(vec_idx_request(&[("index_type", "IVF_FLAT")]))
        .await;
    assert!(status.is_success());

    // the data plane commits a segment after the index exists
    let segment = cluster.add_flushed_segment(3, 700);
    cluster
        .kv
        .put(
            &lodestone::kv::paths::flushed_segment(100, 1, 3),
            lodestone::kv::encode(&segment).unwrap(),
        )
        .await
        .unwrap();

    let coordinator = cluster.coordinator.clone();
    wait_for("watcher-driven build to finish", || {
        let coordinator = coordinator.clone();
        async move {
            let progress = coordinator.get_index_build_progress(100, "vec_idx").await;
            progress.indexed_rows == 700
        }
    })
    .await;

    cluster.coordinator.stop().await;
}
