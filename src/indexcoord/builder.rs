//! Index build scheduling
//!
//! Runs the per-segment build state machine: assign Unissued builds to the
//! least-loaded healthy worker, poll in-progress builds in per-node batches,
//! re-queue builds whose worker disappeared, and hand finished builds to
//! publication. The loop is a single cooperative worker; every outbound call
//! carries a timeout and transport failures only ever cost throughput.

use crate::cluster::worker::{CreateJobRequest, DataCoord};
use crate::config::IndexCoordConfig;
use crate::indexcoord::handoff::Handoff;
use crate::indexcoord::meta_table::{MetaTable, SegmentIndex};
use crate::indexcoord::node_manager::NodeManager;
use crate::types::{BuildId, IndexState, NodeId};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

struct Backoff {
    delay: Duration,
    until: Instant,
}

/// Per-node retry backoff, capped. A node in backoff is skipped by both the
/// assignment and the polling pass until its window elapses.
struct BackoffTracker {
    cap: Duration,
    entries: Mutex<HashMap<NodeId, Backoff>>,
}

impl BackoffTracker {
    fn new(cap: Duration) -> Self {
        Self {
            cap,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn ready(&self, node_id: NodeId) -> bool {
        self.entries
            .lock()
            .get(&node_id)
            .map(|b| Instant::now() >= b.until)
            .unwrap_or(true)
    }

    fn record_failure(&self, node_id: NodeId) {
        let mut entries = self.entries.lock();
        let delay = entries
            .get(&node_id)
            .map(|b| (b.delay * 2).min(self.cap))
            .unwrap_or(BACKOFF_INITIAL);
        entries.insert(
            node_id,
            Backoff {
                delay,
                until: Instant::now() + delay,
            },
        );
    }

    fn record_success(&self, node_id: NodeId) {
        self.entries.lock().remove(&node_id);
    }
}

pub struct IndexBuilder {
    meta: Arc<MetaTable>,
    nodes: Arc<NodeManager>,
    data_coord: Arc<dyn DataCoord>,
    handoff: Arc<Handoff>,
    config: IndexCoordConfig,
    backoff: BackoffTracker,
}

impl IndexBuilder {
    pub fn new(
        meta: Arc<MetaTable>,
        nodes: Arc<NodeManager>,
        data_coord: Arc<dyn DataCoord>,
        handoff: Arc<Handoff>,
        config: IndexCoordConfig,
    ) -> Self {
        let cap = config.rpc_backoff_max;
        Self {
            meta,
            nodes,
            data_coord,
            handoff,
            config,
            backoff: BackoffTracker::new(cap),
        }
    }

    /// Tick until cancelled. A failed tick is logged and retried whole on the
    /// next interval; persistence failures never leave a partial commit
    /// because every store write is single-key.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.builder_tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("index builder started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("index builder stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(%err, "builder tick failed, will retry");
                    }
                }
            }
        }
    }

    /// One pass of the state machine. Public for deterministic tests.
    pub async fn tick(&self) -> Result<()> {
        self.abort_dropped().await?;
        self.reset_retries().await?;
        self.assign_unissued().await?;
        self.poll_in_progress().await?;
        Ok(())
    }

    /// Builds whose index was dropped while a worker still held the job:
    /// tell the worker to discard it, release the segment lock, and park the
    /// row as Failed until GC removes it.
    async fn abort_dropped(&self) -> Result<()> {
        for row in self.meta.tombstoned_in_progress().await {
            if let Some(node) = self.nodes.get(row.node_id) {
                if let Err(err) = node.client().drop_jobs(&[row.build_id]).await {
                    warn!(build_id = row.build_id, node_id = row.node_id, %err,
                        "drop job failed, will retry");
                    continue;
                }
                node.dec_task_count();
            }
            if let Err(err) = self
                .data_coord
                .release_segment_lock(row.build_id, row.node_id)
                .await
            {
                warn!(build_id = row.build_id, %err, "segment lock release failed");
            }
            self.meta
                .mark_task_failed(row.build_id, "index dropped".to_string())
                .await?;
            info!(build_id = row.build_id, "aborted build of dropped index");
        }
        Ok(())
    }

    /// Every in-progress build on a lost node goes back through Retry.
    pub async fn node_down(&self, node_id: NodeId) {
        let in_progress = self.meta.segment_indexes_with_state(IndexState::InProgress).await;
        for row in in_progress.into_iter().filter(|r| r.node_id == node_id) {
            warn!(build_id = row.build_id, node_id, "node lost, retrying build");
            if let Err(err) = self.meta.mark_task_retry(row.build_id).await {
                warn!(build_id = row.build_id, %err, "failed to mark retry");
            }
        }
    }

    /// Retry -> Unissued: release the segment lock, clear the assignment.
    async fn reset_retries(&self) -> Result<()> {
        for row in self.meta.segment_indexes_with_state(IndexState::Retry).await {
            if row.node_id != 0 {
                if let Err(err) = self
                    .data_coord
                    .release_segment_lock(row.build_id, row.node_id)
                    .await
                {
                    warn!(build_id = row.build_id, %err, "segment lock release failed");
                }
                if let Some(node) = self.nodes.get(row.node_id) {
                    node.dec_task_count();
                }
            }
            self.meta.reset_task(row.build_id).await?;
            debug!(build_id = row.build_id, "build re-queued");
        }
        Ok(())
    }

    /// Assign Unissued builds in `(create_ts, build_id)` order.
    async fn assign_unissued(&self) -> Result<()> {
        let mut pending = self.meta.segment_indexes_with_state(IndexState::Unissued).await;
        pending.sort_by_key(|row| (row.create_ts, row.build_id));

        for row in pending {
            let node = match self.nodes.pick_node() {
                Ok(node) => node,
                Err(Error::NoAvailableNode) => {
                    debug!("no assignable worker, deferring builds");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if !self.backoff.ready(node.node_id) {
                continue;
            }

            if let Err(err) = self
                .data_coord
                .acquire_segment_lock(row.build_id, node.node_id, &[row.segment_id])
                .await
            {
                // segment may have been compacted away; GC reaps the row
                warn!(build_id = row.build_id, segment_id = row.segment_id, %err,
                    "segment lock not acquired, deferring build");
                continue;
            }

            let index_meta = self.meta.get_index(row.index_id).await;
            let request = build_request(&row, index_meta.as_ref());
            let created = with_timeout(
                self.config.create_job_timeout,
                node.client().create_job(request),
            )
            .await;

            match created {
                Ok(()) => {
                    self.meta.assign_task(row.build_id, node.node_id).await?;
                    node.inc_task_count();
                    node.mark_heartbeat();
                    self.backoff.record_success(node.node_id);
                    info!(build_id = row.build_id, node_id = node.node_id, "build assigned");
                }
                Err(err) => {
                    warn!(build_id = row.build_id, node_id = node.node_id, %err,
                        "create job failed, leaving unissued");
                    self.backoff.record_failure(node.node_id);
                    if let Err(release_err) = self
                        .data_coord
                        .release_segment_lock(row.build_id, node.node_id)
                        .await
                    {
                        warn!(build_id = row.build_id, %release_err, "segment lock release failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll in-progress builds with one batched QueryJobs per node.
    async fn poll_in_progress(&self) -> Result<()> {
        let in_progress = self.meta.segment_indexes_with_state(IndexState::InProgress).await;
        let mut by_node: HashMap<NodeId, Vec<SegmentIndex>> = HashMap::new();
        for row in in_progress {
            by_node.entry(row.node_id).or_default().push(row);
        }

        for (node_id, rows) in by_node {
            let Some(node) = self.nodes.get(node_id) else {
                for row in rows {
                    warn!(build_id = row.build_id, node_id, "node unknown, retrying build");
                    self.meta.mark_task_retry(row.build_id).await?;
                }
                continue;
            };
            if !self.backoff.ready(node_id) {
                continue;
            }

            let build_ids: Vec<BuildId> = rows.iter().map(|r| r.build_id).collect();
            let results = match with_timeout(
                self.config.create_job_timeout,
                node.client().query_jobs(&build_ids),
            )
            .await
            {
                Ok(results) => results,
                Err(err) => {
                    warn!(node_id, %err, "query jobs failed");
                    self.backoff.record_failure(node_id);
                    continue;
                }
            };
            node.mark_heartbeat();
            self.backoff.record_success(node_id);

            let mut reported: HashMap<BuildId, _> = results
                .into_iter()
                .map(|result| (result.build_id, result))
                .collect();

            for row in rows {
                match reported.remove(&row.build_id) {
                    Some(result) => match result.state {
                        IndexState::Finished => {
                            self.meta
                                .finish_task(
                                    row.build_id,
                                    node_id,
                                    result.file_keys,
                                    result.index_size,
                                )
                                .await?;
                            self.complete(&row, &node).await;
                            self.handoff.enqueue(row.build_id);
                            info!(build_id = row.build_id, node_id, "build finished");
                        }
                        IndexState::Failed => {
                            self.meta
                                .mark_task_failed(row.build_id, result.fail_reason)
                                .await?;
                            self.complete(&row, &node).await;
                            warn!(build_id = row.build_id, node_id, "build failed");
                        }
                        _ => {}
                    },
                    None => {
                        // the worker no longer knows the job
                        warn!(build_id = row.build_id, node_id, "job missing on worker, retrying");
                        self.meta.mark_task_retry(row.build_id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Terminal transition bookkeeping shared by Finished and Failed.
    async fn complete(&self, row: &SegmentIndex, node: &crate::indexcoord::node_manager::WorkerNode) {
        if let Err(err) = self
            .data_coord
            .release_segment_lock(row.build_id, row.node_id)
            .await
        {
            warn!(build_id = row.build_id, %err, "segment lock release failed");
        }
        node.dec_task_count();
    }
}

fn build_request(
    row: &SegmentIndex,
    index_meta: Option<&crate::indexcoord::meta_table::IndexMeta>,
) -> CreateJobRequest {
    CreateJobRequest {
        build_id: row.build_id,
        collection_id: row.collection_id,
        partition_id: row.partition_id,
        segment_id: row.segment_id,
        num_rows: row.num_rows,
        index_name: index_meta.map(|m| m.index_name.clone()).unwrap_or_default(),
        type_params: index_meta.map(|m| m.type_params.clone()).unwrap_or_default(),
        index_params: index_meta.map(|m| m.index_params.clone()).unwrap_or_default(),
        index_version: row.index_version + 1,
        storage_path: storage_path(row.build_id),
    }
}

/// Object-store prefix a build's artifact files live under.
pub fn storage_path(build_id: BuildId) -> String {
    format!("index-files/{build_id}")
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout)?
}
