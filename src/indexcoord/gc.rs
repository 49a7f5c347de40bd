//! Garbage collection of index metadata and artifact files
//!
//! Periodic three-phase sweep: tombstoned index definitions whose build rows
//! have all been reaped, artifact files whose build id no longer has a row,
//! and build rows whose segment the data plane no longer knows. Object-store
//! listings are paged and rate-limited so a large artifact tree cannot
//! monopolize the store.

use crate::clock::BoundedClock;
use crate::cluster::worker::DataCoord;
use crate::config::IndexCoordConfig;
use crate::indexcoord::builder::storage_path;
use crate::indexcoord::meta_table::MetaTable;
use crate::types::BuildId;
use crate::Result;
use futures::StreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INDEX_FILES_ROOT: &str = "index-files";

pub struct GarbageCollector {
    meta: Arc<MetaTable>,
    object_store: Arc<dyn ObjectStore>,
    data_coord: Arc<dyn DataCoord>,
    clock: Arc<BoundedClock>,
    config: IndexCoordConfig,
    /// build id -> first time its segment was reported missing (nanos)
    missing_since: Mutex<HashMap<BuildId, i64>>,
}

impl GarbageCollector {
    pub fn new(
        meta: Arc<MetaTable>,
        object_store: Arc<dyn ObjectStore>,
        data_coord: Arc<dyn DataCoord>,
        clock: Arc<BoundedClock>,
        config: IndexCoordConfig,
    ) -> Self {
        Self {
            meta,
            object_store,
            data_coord,
            clock,
            config,
            missing_since: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("garbage collector started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// One full sweep. Public for deterministic tests.
    pub async fn sweep(&self) {
        if let Err(err) = self.sweep_deleted_indexes().await {
            warn!(%err, "deleted index sweep failed");
        }
        if let Err(err) = self.sweep_orphan_files().await {
            warn!(%err, "orphan file sweep failed");
        }
        if let Err(err) = self.sweep_missing_segments().await {
            warn!(%err, "missing segment sweep failed");
        }
    }

    /// Remove tombstoned builds (files first, then rows), and index
    /// definitions once no rows remain. A meta row whose files were already
    /// deleted out-of-band is still removed.
    async fn sweep_deleted_indexes(&self) -> Result<()> {
        for index in self.meta.get_deleted_indexes().await {
            let rows = self.meta.get_segment_indexes_of_index(index.index_id).await;
            for row in &rows {
                self.remove_build_files(row.build_id).await?;
                self.meta.remove_segment_index(row.build_id).await?;
                debug!(build_id = row.build_id, "reaped tombstoned build");
            }
            self.meta.remove_index_meta(index.index_id).await?;
            info!(
                index_id = index.index_id,
                index_name = %index.index_name,
                "reaped tombstoned index"
            );
        }
        Ok(())
    }

    /// Delete artifact directories whose build id has no row.
    async fn sweep_orphan_files(&self) -> Result<()> {
        let known = self.meta.all_build_ids().await;
        let root = Path::from(INDEX_FILES_ROOT);
        let listing = self.object_store.list_with_delimiter(Some(&root)).await?;

        for prefix in listing.common_prefixes {
            let Some(build_id) = parse_build_id(&prefix) else {
                warn!(prefix = %prefix, "unparseable artifact directory, skipping");
                continue;
            };
            if known.contains(&build_id) {
                continue;
            }
            info!(build_id, "removing orphaned artifact files");
            self.remove_build_files(build_id).await?;
        }
        Ok(())
    }

    /// Reap rows whose segment the data plane has reported missing for
    /// longer than the orphan timeout (skew-adjusted).
    async fn sweep_missing_segments(&self) -> Result<()> {
        let cutoff = self
            .clock
            .orphan_cutoff_nanos(self.config.orphan_timeout.as_nanos() as i64);

        for row in self.meta.all_segment_indexes().await {
            if self.data_coord.segment_exists(row.segment_id).await? {
                self.missing_since.lock().remove(&row.build_id);
                continue;
            }
            let first_missing = *self
                .missing_since
                .lock()
                .entry(row.build_id)
                .or_insert_with(|| self.clock.now_nanos());
            if first_missing > cutoff {
                continue;
            }
            info!(
                build_id = row.build_id,
                segment_id = row.segment_id,
                "segment gone past orphan timeout, reaping build"
            );
            self.remove_build_files(row.build_id).await?;
            self.meta.remove_segment_index(row.build_id).await?;
            self.missing_since.lock().remove(&row.build_id);
        }
        Ok(())
    }

    /// Delete everything under `index-files/{build_id}/`, in rate-limited
    /// pages.
    async fn remove_build_files(&self, build_id: BuildId) -> Result<()> {
        let prefix = Path::from(storage_path(build_id));
        let mut pages = self
            .object_store
            .list(Some(&prefix))
            .chunks(self.config.gc_list_page_size);

        while let Some(page) = pages.next().await {
            for entry in page {
                let entry = entry?;
                self.object_store.delete(&entry.location).await?;
                debug!(location = %entry.location, "deleted artifact file");
            }
            tokio::time::sleep(self.config.gc_list_pause).await;
        }
        Ok(())
    }
}

fn parse_build_id(prefix: &Path) -> Option<BuildId> {
    prefix.as_ref().rsplit('/').next()?.parse().ok()
}
