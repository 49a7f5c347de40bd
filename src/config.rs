//! Coordinator configuration
//!
//! An immutable configuration record passed into constructors; there is no
//! process-wide mutable parameter table. Binaries build one record at startup
//! (environment-driven factories below) and subsystems keep whatever slice
//! they were constructed with. Hot reload is exposed through
//! [`ConfigHandle::subscribe`]; a subsystem that wants updates holds the
//! receiver and re-reads on change.

use crate::kv::{MemoryKv, MetaKv};
use crate::types::NodeId;
use crate::Result;
use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Static worker binding, replacing service discovery when set.
#[derive(Debug, Clone)]
pub struct BindNode {
    pub node_id: NodeId,
    pub address: String,
}

/// Index coordinator tunables.
#[derive(Debug, Clone)]
pub struct IndexCoordConfig {
    /// Builder state-machine tick interval
    pub builder_tick_interval: Duration,
    /// Timeout for CreateJob calls to index workers
    pub create_job_timeout: Duration,
    /// A node whose last heartbeat is older than this is not assignable
    pub node_heartbeat_ttl: Duration,
    /// Cap for exponential backoff on worker rpc retries
    pub rpc_backoff_max: Duration,
    /// Garbage collector sweep interval
    pub gc_interval: Duration,
    /// Object-store listing page size during GC sweeps
    pub gc_list_page_size: usize,
    /// Pause between GC listing pages (rate limit)
    pub gc_list_pause: Duration,
    /// A segment index row whose segment has been gone this long is reaped
    pub orphan_timeout: Duration,
    /// Admission queue capacity; enqueue fails when full
    pub task_queue_capacity: usize,
    /// Static single-worker registration, skipping discovery
    pub bind_node: Option<BindNode>,
}

impl Default for IndexCoordConfig {
    fn default() -> Self {
        Self {
            builder_tick_interval: Duration::from_millis(200),
            create_job_timeout: Duration::from_secs(10),
            node_heartbeat_ttl: Duration::from_secs(30),
            rpc_backoff_max: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            gc_list_page_size: 1000,
            gc_list_pause: Duration::from_millis(10),
            orphan_timeout: Duration::from_secs(24 * 3600),
            task_queue_capacity: 1024,
            bind_node: None,
        }
    }
}

/// Query coordinator tunables.
#[derive(Debug, Clone)]
pub struct QueryCoordConfig {
    /// Per-worker distribution pull interval
    pub dist_pull_interval: Duration,
    /// Timeout for GetDataDistribution calls
    pub dist_req_timeout: Duration,
    /// Collection/leader observer tick interval
    pub observer_interval: Duration,
    /// A collection Loading longer than this is released with failure
    pub load_timeout: Duration,
    /// Balancer tick interval
    pub balance_interval: Duration,
    /// Migration trigger: move when `max - min > (max+min)/2 * ratio`
    pub balance_threshold_ratio: f64,
    /// How many times a failed worker action is requeued before being dropped
    pub action_retry_limit: usize,
}

impl Default for QueryCoordConfig {
    fn default() -> Self {
        Self {
            dist_pull_interval: Duration::from_millis(500),
            dist_req_timeout: Duration::from_secs(3),
            observer_interval: Duration::from_secs(1),
            load_timeout: Duration::from_secs(600),
            balance_interval: Duration::from_secs(5),
            balance_threshold_ratio: 0.25,
            action_retry_limit: 3,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// This coordinator's own node id (session identity)
    pub node_id: NodeId,
    /// Active/standby election enabled
    pub enable_active_standby: bool,
    pub index: IndexCoordConfig,
    pub query: QueryCoordConfig,
}

impl CoordinatorConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Only a handful of deploy-time knobs are environment-driven; the rest
    /// are code-level defaults overridable by the embedding binary.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("LODESTONE_NODE_ID") {
            config.node_id = v
                .parse()
                .map_err(|_| crate::Error::Config(format!("invalid LODESTONE_NODE_ID: {v}")))?;
        }
        if let Ok(v) = std::env::var("LODESTONE_ACTIVE_STANDBY") {
            let v = v.trim();
            config.enable_active_standby = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("LODESTONE_LOAD_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| {
                crate::Error::Config(format!("invalid LODESTONE_LOAD_TIMEOUT_SECS: {v}"))
            })?;
            config.query.load_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("LODESTONE_GC_INTERVAL_SECS") {
            let secs: u64 = v.parse().map_err(|_| {
                crate::Error::Config(format!("invalid LODESTONE_GC_INTERVAL_SECS: {v}"))
            })?;
            config.index.gc_interval = Duration::from_secs(secs);
        }
        if let (Ok(id), Ok(addr)) = (
            std::env::var("LODESTONE_BIND_NODE_ID"),
            std::env::var("LODESTONE_BIND_NODE_ADDR"),
        ) {
            let node_id = id
                .parse()
                .map_err(|_| crate::Error::Config(format!("invalid LODESTONE_BIND_NODE_ID: {id}")))?;
            config.index.bind_node = Some(BindNode {
                node_id,
                address: addr,
            });
        }

        Ok(config)
    }
}

/// Shared handle to the current configuration with a subscribe surface.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<CoordinatorConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Latest configuration snapshot.
    pub fn current(&self) -> Arc<CoordinatorConfig> {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CoordinatorConfig>> {
        self.tx.subscribe()
    }

    /// Replace the configuration, notifying all subscribers.
    pub fn update(&self, config: CoordinatorConfig) {
        let _ = self.tx.send(Arc::new(config));
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default) or "s3"
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY: credentials (optional)
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    crate::Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!("Using S3 object store: bucket={}, region={}", bucket, region);

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory' or 's3'",
                backend
            ))),
        }
    }

    /// Create the metadata store client from environment
    ///
    /// Environment variables:
    /// - METADATA_BACKEND: "memory" (default)
    ///
    /// External store backends are wired in by the embedding process through
    /// the [`MetaKv`] trait; the bundled backend is in-memory.
    pub async fn create_meta_kv() -> Result<Arc<dyn MetaKv>> {
        let backend = std::env::var("METADATA_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory metadata store (development mode)");
                Ok(Arc::new(MemoryKv::new()))
            }
            _ => Err(crate::Error::Config(format!(
                "Unknown METADATA_BACKEND: {}. Use 'memory'",
                backend
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_intervals() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.index.builder_tick_interval, Duration::from_millis(200));
        assert_eq!(config.index.create_job_timeout, Duration::from_secs(10));
        assert_eq!(config.query.dist_req_timeout, Duration::from_secs(3));
        assert_eq!(config.query.observer_interval, Duration::from_secs(1));
        assert!((config.query.balance_threshold_ratio - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn subscribe_observes_update() {
        let handle = ConfigHandle::new(CoordinatorConfig::default());
        let mut rx = handle.subscribe();

        let mut updated = CoordinatorConfig::default();
        updated.query.load_timeout = Duration::from_secs(2);
        handle.update(updated);

        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().query.load_timeout,
            Duration::from_secs(2)
        );
        assert_eq!(handle.current().query.load_timeout, Duration::from_secs(2));
    }
}
