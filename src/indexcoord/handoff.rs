//! Handoff publication
//!
//! Makes finished indexes visible to the query plane by writing
//! `handoff/{collection}/{partition}/{segment}` rows. The builder enqueues a
//! task per finished build; the drain loop re-checks the row is still live
//! before publishing, so builds whose index was dropped in the meantime are
//! skipped.

use crate::indexcoord::meta_table::{MetaTable, SegmentIndex};
use crate::kv::{self, paths, MetaKv};
use crate::types::{BuildId, CollectionId, IndexId, PartitionId, SegmentId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Published record consumed by the query plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub index_id: IndexId,
    pub build_id: BuildId,
}

pub struct Handoff {
    kv: Arc<dyn MetaKv>,
    meta: Arc<MetaTable>,
    tx: mpsc::UnboundedSender<BuildId>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BuildId>>>,
}

impl Handoff {
    pub fn new(kv: Arc<dyn MetaKv>, meta: Arc<MetaTable>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            kv,
            meta,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue a finished build for publication.
    pub fn enqueue(&self, build_id: BuildId) {
        let _ = self.tx.send(build_id);
    }

    /// Drain the queue until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("handoff loop started twice");
        info!("handoff loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("handoff loop stopped");
                    return;
                }
                build_id = rx.recv() => match build_id {
                    Some(build_id) => {
                        if let Err(err) = self.publish(build_id).await {
                            warn!(build_id, %err, "handoff publish failed, requeueing");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            let _ = self.tx.send(build_id);
                        }
                    }
                    None => return,
                },
            }
        }
    }

    async fn publish(&self, build_id: BuildId) -> Result<()> {
        let Some(row) = self.meta.get_segment_index(build_id).await else {
            debug!(build_id, "skipping handoff for removed build");
            return Ok(());
        };
        if row.deleted {
            debug!(build_id, "skipping handoff for tombstoned build");
            return Ok(());
        }
        let record = record_for(&row);
        self.kv
            .put(
                &paths::handoff(row.collection_id, row.partition_id, row.segment_id),
                kv::encode(&record)?,
            )
            .await?;
        info!(
            build_id,
            segment_id = row.segment_id,
            collection_id = row.collection_id,
            "published index handoff"
        );
        Ok(())
    }
}

fn record_for(row: &SegmentIndex) -> HandoffRecord {
    HandoffRecord {
        collection_id: row.collection_id,
        partition_id: row.partition_id,
        segment_id: row.segment_id,
        index_id: row.index_id,
        build_id: row.build_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::BoundedClock;
    use crate::indexcoord::meta_table::CreateIndexSpec;
    use crate::kv::MemoryKv;
    use crate::types::SegmentInfo;

    #[tokio::test]
    async fn test_publish_and_skip_deleted() {
        let kv = Arc::new(MemoryKv::new());
        let meta = Arc::new(
            MetaTable::new(kv.clone(), Arc::new(BoundedClock::default()))
                .await
                .unwrap(),
        );

        let index_id = meta
            .create_index(CreateIndexSpec {
                collection_id: 100,
                field_id: 2,
                index_name: "vec_idx".to_string(),
                type_params: Default::default(),
                index_params: Default::default(),
                alternate: false,
            })
            .await
            .unwrap();
        let segment = SegmentInfo {
            segment_id: 5,
            collection_id: 100,
            partition_id: 1,
            insert_channel: "dml_0".to_string(),
            num_rows: 10,
        };
        let build_id = meta.add_segment_index(&segment, index_id).await.unwrap();
        meta.assign_task(build_id, 10).await.unwrap();
        meta.finish_task(build_id, 10, vec!["f".to_string()], 1).await.unwrap();

        let handoff = Handoff::new(kv.clone(), meta.clone());
        handoff.publish(build_id).await.unwrap();
        assert!(kv.get(&paths::handoff(100, 1, 5)).await.unwrap().is_some());

        // tombstoned builds are not re-published
        meta.mark_index_as_deleted(100, &[index_id]).await.unwrap();
        kv.remove(&paths::handoff(100, 1, 5)).await.unwrap();
        handoff.publish(build_id).await.unwrap();
        assert!(kv.get(&paths::handoff(100, 1, 5)).await.unwrap().is_none());
    }
}
