//! Flushed segment watcher
//!
//! Subscribes to `flushed-segment/` and creates a build task per active index
//! whenever the data plane commits a segment. The loop is a two-state
//! machine: `Streaming` consumes watch events from a recorded revision;
//! `Reloading` re-scans the whole prefix after the store compacts the watch
//! away, then resumes streaming at the scan revision.

use crate::cluster::worker::DataCoord;
use crate::indexcoord::meta_table::MetaTable;
use crate::kv::{self, paths, MetaKv, WatchEvent};
use crate::types::{SegmentId, SegmentInfo};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RELOAD_RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct FlushedSegmentWatcher {
    kv: Arc<dyn MetaKv>,
    meta: Arc<MetaTable>,
    data_coord: Arc<dyn DataCoord>,
}

impl FlushedSegmentWatcher {
    pub fn new(
        kv: Arc<dyn MetaKv>,
        meta: Arc<MetaTable>,
        data_coord: Arc<dyn DataCoord>,
    ) -> Self {
        Self {
            kv,
            meta,
            data_coord,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        info!("flushed segment watcher started");
        let mut next_revision = loop {
            match self.reload_and_process().await {
                Ok(revision) => break revision + 1,
                Err(err) => {
                    warn!(%err, "initial flushed segment scan failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RELOAD_RETRY_PAUSE) => {}
                    }
                }
            }
        };

        'subscribe: loop {
            let mut rx = match self.kv.watch_prefix(paths::FLUSHED_SEGMENT, next_revision).await {
                Ok(rx) => rx,
                Err(Error::KvCompacted { requested, earliest }) => {
                    warn!(requested, earliest, "watch compacted, reloading from store");
                    match self.reload_and_process().await {
                        Ok(revision) => next_revision = revision + 1,
                        Err(err) => {
                            warn!(%err, "reload after compaction failed, retrying");
                            tokio::time::sleep(RELOAD_RETRY_PAUSE).await;
                        }
                    }
                    continue 'subscribe;
                }
                Err(err) => {
                    warn!(%err, "flushed segment watch failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RELOAD_RETRY_PAUSE) => {}
                    }
                    continue 'subscribe;
                }
            };

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("flushed segment watcher stopped");
                        return;
                    }
                    event = rx.recv() => match event {
                        Some(WatchEvent::Put { key, value, revision }) => {
                            next_revision = revision + 1;
                            if let Err(err) = self.handle_flushed(&key, &value).await {
                                warn!(%key, %err, "failed to handle flushed segment");
                            }
                        }
                        Some(WatchEvent::Delete { key, revision }) => {
                            next_revision = revision + 1;
                            debug!(%key, "flushed segment key removed");
                        }
                        // watch severed by the store, re-subscribe
                        None => continue 'subscribe,
                    },
                }
            }
        }
    }

    /// Full scan of the prefix; processes every segment and returns the scan
    /// revision to resume watching from.
    async fn reload_and_process(&self) -> Result<u64> {
        let (pairs, revision) = self.kv.load_prefix(paths::FLUSHED_SEGMENT).await?;
        debug!(count = pairs.len(), revision, "scanned flushed segments");
        for (key, value) in pairs {
            if let Err(err) = self.handle_flushed(&key, &value).await {
                warn!(%key, %err, "failed to handle flushed segment during reload");
            }
        }
        Ok(revision)
    }

    async fn handle_flushed(&self, key: &str, value: &[u8]) -> Result<()> {
        let segment = self.decode_segment(value).await?;
        debug!(%key, segment_id = segment.segment_id, "flushed segment observed");
        self.create_index_for_segment(&segment).await
    }

    /// Decode a flushed-segment value, falling back to the legacy encoding
    /// that carries only the numeric segment id.
    async fn decode_segment(&self, value: &[u8]) -> Result<SegmentInfo> {
        if let Ok(segment) = kv::decode::<SegmentInfo>(value) {
            return Ok(segment);
        }
        let text = std::str::from_utf8(value)
            .map_err(|_| Error::Serialization("flushed segment value is not utf-8".to_string()))?;
        let segment_id: SegmentId = text.trim().parse().map_err(|_| {
            Error::Serialization(format!("flushed segment value is not a segment id: {text}"))
        })?;
        self.data_coord
            .get_segment_info(segment_id)
            .await?
            .ok_or(Error::SegmentNotFound(segment_id))
    }

    /// Create one build per active index on the segment's collection.
    /// Idempotent: segments already carrying a build for an index are
    /// skipped.
    pub async fn create_index_for_segment(&self, segment: &SegmentInfo) -> Result<()> {
        for index in self
            .meta
            .get_indexes_for_collection(segment.collection_id)
            .await
        {
            if self
                .meta
                .has_same_index(segment.segment_id, index.index_id)
                .await
                .is_some()
            {
                continue;
            }
            let build_id = self.meta.add_segment_index(segment, index.index_id).await?;
            info!(
                segment_id = segment.segment_id,
                index_id = index.index_id,
                build_id,
                "created index build for flushed segment"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::BoundedClock;
    use crate::cluster::LocalDataCoord;
    use crate::indexcoord::meta_table::CreateIndexSpec;
    use crate::kv::MemoryKv;
    use crate::types::IndexState;

    fn segment(id: SegmentId, rows: i64) -> SegmentInfo {
        SegmentInfo {
            segment_id: id,
            collection_id: 100,
            partition_id: 1,
            insert_channel: "dml_0".to_string(),
            num_rows: rows,
        }
    }

    async fn fixture() -> (Arc<MemoryKv>, Arc<MetaTable>, Arc<LocalDataCoord>, FlushedSegmentWatcher) {
        let kv = Arc::new(MemoryKv::new());
        let meta = Arc::new(
            MetaTable::new(kv.clone(), Arc::new(BoundedClock::default()))
                .await
                .unwrap(),
        );
        let data_coord = Arc::new(LocalDataCoord::new());
        let watcher = FlushedSegmentWatcher::new(kv.clone(), meta.clone(), data_coord.clone());
        (kv, meta, data_coord, watcher)
    }

    async fn create_index(meta: &MetaTable) -> i64 {
        meta.create_index(CreateIndexSpec {
            collection_id: 100,
            field_id: 2,
            index_name: "vec_idx".to_string(),
            type_params: Default::default(),
            index_params: Default::default(),
            alternate: false,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_flushed_event_creates_build() {
        let (kv, meta, _, watcher) = fixture().await;
        let index_id = create_index(&meta).await;

        let token = CancellationToken::new();
        let handle = tokio::spawn(async move { watcher.run(token.clone()).await });

        kv.put(
            &paths::flushed_segment(100, 1, 5),
            kv::encode(&segment(5, 1000)).unwrap(),
        )
        .await
        .unwrap();

        // wait for the watcher to react
        for _ in 0..50 {
            if meta.has_same_index(5, index_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let build_id = meta.has_same_index(5, index_id).await.expect("build created");
        let row = meta.get_segment_index(build_id).await.unwrap();
        assert_eq!(row.state, IndexState::Unissued);
        assert_eq!(row.num_rows, 1000);

        handle.abort();
    }

    #[tokio::test]
    async fn test_legacy_numeric_value_falls_back() {
        let (_, meta, data_coord, watcher) = fixture().await;
        let index_id = create_index(&meta).await;
        data_coord.add_segment(segment(7, 42));

        watcher.handle_flushed("flushed-segment/100/1/7", b"7").await.unwrap();
        let build_id = meta.has_same_index(7, index_id).await.expect("build created");
        assert_eq!(meta.get_segment_index(build_id).await.unwrap().num_rows, 42);
    }

    #[tokio::test]
    async fn test_create_index_for_segment_idempotent() {
        let (_, meta, _, watcher) = fixture().await;
        let index_id = create_index(&meta).await;

        let seg = segment(5, 10);
        watcher.create_index_for_segment(&seg).await.unwrap();
        let first = meta.has_same_index(5, index_id).await.unwrap();
        watcher.create_index_for_segment(&seg).await.unwrap();
        assert_eq!(meta.has_same_index(5, index_id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_compaction_triggers_full_reload() {
        let (kv, meta, _, watcher) = fixture().await;
        let index_id = create_index(&meta).await;

        kv.put(
            &paths::flushed_segment(100, 1, 9),
            kv::encode(&segment(9, 10)).unwrap(),
        )
        .await
        .unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(async move { watcher.run(token.clone()).await });

        for _ in 0..50 {
            if meta.has_same_index(9, index_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(meta.has_same_index(9, index_id).await.is_some());

        // advance the store past the watcher's resume point, then compact:
        // the active watch is severed and the stale re-subscribe fails with
        // KvCompacted, forcing the full-reload path
        for i in 0..5 {
            kv.put(&format!("unrelated/{i}"), vec![i]).await.unwrap();
        }
        let rev = kv.current_revision().await.unwrap();
        kv.compact(rev);

        kv.put(
            &paths::flushed_segment(100, 1, 10),
            kv::encode(&segment(10, 10)).unwrap(),
        )
        .await
        .unwrap();
        for _ in 0..100 {
            if meta.has_same_index(10, index_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(meta.has_same_index(10, index_id).await.is_some());

        handle.abort();
    }
}
