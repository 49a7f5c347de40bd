//! Durable index metadata
//!
//! MetaTable owns every IndexMeta and SegmentIndex row. All mutations are
//! write-through: the store write completes before the in-memory maps change
//! and before the lock is released, so a crash between the two leaves the
//! store ahead of memory, never behind. In-memory state is only ever
//! populated by reading the store on init or standby promotion.

use crate::clock::{BoundedClock, IdAllocator};
use crate::kv::{self, paths, MetaKv};
use crate::types::{
    BuildId, CollectionId, FieldId, IndexId, IndexState, NodeId, PartitionId, SegmentId,
    SegmentInfo,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One index definition on a collection field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub collection_id: CollectionId,
    pub field_id: FieldId,
    pub index_id: IndexId,
    pub index_name: String,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
    pub create_ts: i64,
    pub deleted: bool,
}

/// One index build against one segment; `build_id` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub build_id: BuildId,
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub index_id: IndexId,
    pub num_rows: i64,
    /// Attempt counter, bumped on every assignment
    pub index_version: i64,
    /// 0 while unassigned
    pub node_id: NodeId,
    pub state: IndexState,
    pub fail_reason: String,
    pub file_keys: Vec<String>,
    pub index_size: i64,
    pub create_ts: i64,
    pub deleted: bool,
}

/// CreateIndex intent, after request validation.
#[derive(Debug, Clone)]
pub struct CreateIndexSpec {
    pub collection_id: CollectionId,
    pub field_id: FieldId,
    pub index_name: String,
    pub type_params: BTreeMap<String, String>,
    pub index_params: BTreeMap<String, String>,
    /// Allow a second index on a field that already has one
    pub alternate: bool,
}

#[derive(Default)]
struct MetaTableInner {
    indexes: HashMap<IndexId, IndexMeta>,
    segment_indexes: HashMap<BuildId, SegmentIndex>,
    /// segment -> index -> build, for idempotency lookups
    by_segment: HashMap<SegmentId, HashMap<IndexId, BuildId>>,
}

impl MetaTableInner {
    fn insert_segment_index(&mut self, row: SegmentIndex) {
        self.by_segment
            .entry(row.segment_id)
            .or_default()
            .insert(row.index_id, row.build_id);
        self.segment_indexes.insert(row.build_id, row);
    }

    fn drop_segment_index(&mut self, build_id: BuildId) {
        if let Some(row) = self.segment_indexes.remove(&build_id) {
            if let Some(per_index) = self.by_segment.get_mut(&row.segment_id) {
                per_index.remove(&row.index_id);
                if per_index.is_empty() {
                    self.by_segment.remove(&row.segment_id);
                }
            }
        }
    }
}

/// Durable map of `indexID -> IndexMeta` and `buildID -> SegmentIndex`.
pub struct MetaTable {
    kv: Arc<dyn MetaKv>,
    clock: Arc<BoundedClock>,
    index_ids: IdAllocator,
    build_ids: IdAllocator,
    inner: RwLock<MetaTableInner>,
}

impl MetaTable {
    /// Recover the table from the store.
    pub async fn new(kv: Arc<dyn MetaKv>, clock: Arc<BoundedClock>) -> Result<Self> {
        let table = Self {
            kv,
            clock,
            index_ids: IdAllocator::default(),
            build_ids: IdAllocator::default(),
            inner: RwLock::new(MetaTableInner::default()),
        };
        table.reload_from_kv().await?;
        Ok(table)
    }

    /// Replace in-memory state with a fresh scan of the store. Also invoked
    /// on standby promotion.
    pub async fn reload_from_kv(&self) -> Result<()> {
        let mut fresh = MetaTableInner::default();

        let (pairs, _) = self.kv.load_prefix(paths::INDEX_META).await?;
        for (_, value) in pairs {
            let meta: IndexMeta = kv::decode(&value)?;
            self.index_ids.observe(meta.index_id);
            fresh.indexes.insert(meta.index_id, meta);
        }

        let (pairs, _) = self.kv.load_prefix(paths::SEGMENT_INDEX).await?;
        for (_, value) in pairs {
            let row: SegmentIndex = kv::decode(&value)?;
            self.build_ids.observe(row.build_id);
            fresh.insert_segment_index(row);
        }

        let mut inner = self.inner.write().await;
        info!(
            indexes = fresh.indexes.len(),
            segment_indexes = fresh.segment_indexes.len(),
            "meta table recovered from store"
        );
        *inner = fresh;
        Ok(())
    }

    async fn save_index(&self, meta: &IndexMeta) -> Result<()> {
        self.kv
            .put(
                &paths::index_meta(meta.collection_id, meta.index_id),
                kv::encode(meta)?,
            )
            .await
    }

    async fn save_segment_index(&self, row: &SegmentIndex) -> Result<()> {
        self.kv
            .put(
                &paths::segment_index(row.collection_id, row.partition_id, row.segment_id, row.build_id),
                kv::encode(row)?,
            )
            .await
    }

    fn check_create(inner: &MetaTableInner, spec: &CreateIndexSpec) -> Result<Option<IndexId>> {
        for meta in inner.indexes.values() {
            if meta.deleted || meta.collection_id != spec.collection_id {
                continue;
            }
            if meta.index_name == spec.index_name {
                if meta.field_id == spec.field_id
                    && meta.type_params == spec.type_params
                    && meta.index_params == spec.index_params
                {
                    return Ok(Some(meta.index_id));
                }
                return Err(Error::IndexConflict(format!(
                    "index already exists: {} with different parameters",
                    spec.index_name
                )));
            }
            if meta.field_id == spec.field_id && !spec.alternate {
                return Err(Error::IndexConflict(format!(
                    "field {} already has index {}",
                    spec.field_id, meta.index_name
                )));
            }
        }
        Ok(None)
    }

    /// Validation half of CreateIndex: `Ok(Some(id))` when an identical index
    /// exists (idempotent success), `Ok(None)` when creation may proceed.
    pub async fn can_create_index(&self, spec: &CreateIndexSpec) -> Result<Option<IndexId>> {
        let inner = self.inner.read().await;
        Self::check_create(&inner, spec)
    }

    /// Atomically assign a new index id and persist the definition.
    /// Idempotent for an identical spec.
    pub async fn create_index(&self, spec: CreateIndexSpec) -> Result<IndexId> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = Self::check_create(&inner, &spec)? {
            return Ok(existing);
        }
        let meta = IndexMeta {
            collection_id: spec.collection_id,
            field_id: spec.field_id,
            index_id: self.index_ids.alloc(),
            index_name: spec.index_name,
            type_params: spec.type_params,
            index_params: spec.index_params,
            create_ts: self.clock.now_nanos(),
            deleted: false,
        };
        self.save_index(&meta).await?;
        info!(
            collection_id = meta.collection_id,
            index_id = meta.index_id,
            index_name = %meta.index_name,
            "created index"
        );
        let index_id = meta.index_id;
        inner.indexes.insert(index_id, meta);
        Ok(index_id)
    }

    /// Create an `Unissued` build row for `(segment, index)`. Idempotent:
    /// an existing row for the pair wins.
    pub async fn add_segment_index(
        &self,
        segment: &SegmentInfo,
        index_id: IndexId,
    ) -> Result<BuildId> {
        let mut inner = self.inner.write().await;
        match inner.indexes.get(&index_id) {
            Some(meta) if !meta.deleted => {}
            _ => return Err(Error::IndexNotFound(format!("index id {index_id}"))),
        }
        if let Some(existing) = inner
            .by_segment
            .get(&segment.segment_id)
            .and_then(|per_index| per_index.get(&index_id))
        {
            return Ok(*existing);
        }
        let row = SegmentIndex {
            build_id: self.build_ids.alloc(),
            segment_id: segment.segment_id,
            collection_id: segment.collection_id,
            partition_id: segment.partition_id,
            index_id,
            num_rows: segment.num_rows,
            index_version: 0,
            node_id: 0,
            state: IndexState::Unissued,
            fail_reason: String::new(),
            file_keys: Vec::new(),
            index_size: 0,
            create_ts: self.clock.now_nanos(),
            deleted: false,
        };
        self.save_segment_index(&row).await?;
        debug!(
            build_id = row.build_id,
            segment_id = row.segment_id,
            index_id,
            "enqueued segment index build"
        );
        let build_id = row.build_id;
        inner.insert_segment_index(row);
        Ok(build_id)
    }

    /// Idempotency check: the existing build for `(segment, index)`, if any.
    pub async fn has_same_index(
        &self,
        segment_id: SegmentId,
        index_id: IndexId,
    ) -> Option<BuildId> {
        let inner = self.inner.read().await;
        inner
            .by_segment
            .get(&segment_id)
            .and_then(|per_index| per_index.get(&index_id))
            .copied()
    }

    /// Hand a build to a node: `Unissued -> InProgress`, attempt counter
    /// bumped. Returns the updated row for job construction.
    pub async fn assign_task(&self, build_id: BuildId, node_id: NodeId) -> Result<SegmentIndex> {
        self.transition(build_id, |row| {
            if row.state != IndexState::Unissued {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: row.state.as_str(),
                    to: "InProgress",
                });
            }
            row.state = IndexState::InProgress;
            row.node_id = node_id;
            row.index_version += 1;
            Ok(())
        })
        .await
    }

    /// `InProgress|Retry -> Finished` with the artifact descriptor.
    pub async fn finish_task(
        &self,
        build_id: BuildId,
        node_id: NodeId,
        file_keys: Vec<String>,
        index_size: i64,
    ) -> Result<()> {
        self.transition(build_id, |row| {
            if !matches!(row.state, IndexState::InProgress | IndexState::Retry) {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: row.state.as_str(),
                    to: "Finished",
                });
            }
            if row.node_id != node_id {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: "stale node report",
                    to: "Finished",
                });
            }
            row.state = IndexState::Finished;
            row.file_keys = file_keys;
            row.index_size = index_size;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// `InProgress -> Failed` with the worker-reported reason.
    pub async fn mark_task_failed(&self, build_id: BuildId, reason: String) -> Result<()> {
        self.transition(build_id, |row| {
            if row.state != IndexState::InProgress {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: row.state.as_str(),
                    to: "Failed",
                });
            }
            row.state = IndexState::Failed;
            row.fail_reason = reason.clone();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// `InProgress -> Retry`, when the assigned node is lost.
    pub async fn mark_task_retry(&self, build_id: BuildId) -> Result<()> {
        self.transition(build_id, |row| {
            if row.state != IndexState::InProgress {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: row.state.as_str(),
                    to: "Retry",
                });
            }
            row.state = IndexState::Retry;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// `Retry|InProgress -> Unissued`, clearing the node assignment so the
    /// builder re-issues the job.
    pub async fn reset_task(&self, build_id: BuildId) -> Result<()> {
        self.transition(build_id, |row| {
            if !matches!(row.state, IndexState::Retry | IndexState::InProgress) {
                return Err(Error::InvalidStateTransition {
                    build_id,
                    from: row.state.as_str(),
                    to: "Unissued",
                });
            }
            row.state = IndexState::Unissued;
            row.node_id = 0;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn transition(
        &self,
        build_id: BuildId,
        mutate: impl FnOnce(&mut SegmentIndex) -> Result<()>,
    ) -> Result<SegmentIndex> {
        let mut inner = self.inner.write().await;
        let row = inner
            .segment_indexes
            .get(&build_id)
            .ok_or(Error::BuildNotFound(build_id))?;
        let mut updated = row.clone();
        mutate(&mut updated)?;
        self.save_segment_index(&updated).await?;
        inner.segment_indexes.insert(build_id, updated.clone());
        Ok(updated)
    }

    /// Tombstone index definitions and cascade the soft delete to every
    /// dependent build row. GC removes both later.
    pub async fn mark_index_as_deleted(
        &self,
        collection_id: CollectionId,
        index_ids: &[IndexId],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut batch = Vec::new();
        let mut metas = Vec::new();
        let mut rows = Vec::new();

        for index_id in index_ids {
            let Some(meta) = inner.indexes.get(index_id) else {
                continue;
            };
            if meta.collection_id != collection_id || meta.deleted {
                continue;
            }
            let mut meta = meta.clone();
            meta.deleted = true;
            batch.push((
                paths::index_meta(meta.collection_id, meta.index_id),
                kv::encode(&meta)?,
            ));
            metas.push(meta);

            for row in inner.segment_indexes.values() {
                if row.index_id == *index_id && !row.deleted {
                    let mut row = row.clone();
                    row.deleted = true;
                    batch.push((
                        paths::segment_index(
                            row.collection_id,
                            row.partition_id,
                            row.segment_id,
                            row.build_id,
                        ),
                        kv::encode(&row)?,
                    ));
                    rows.push(row);
                }
            }
        }

        self.kv.multi_put(batch).await?;
        for meta in metas {
            info!(index_id = meta.index_id, index_name = %meta.index_name, "marked index deleted");
            inner.indexes.insert(meta.index_id, meta);
        }
        for row in rows {
            inner.segment_indexes.insert(row.build_id, row);
        }
        Ok(())
    }

    /// Per-segment build states for one index, restricted to rows created at
    /// or after `create_ts` (stale rows from a dropped same-name index are
    /// excluded).
    pub async fn get_index_states(
        &self,
        index_id: IndexId,
        create_ts: i64,
    ) -> Vec<(SegmentId, IndexState, String)> {
        let inner = self.inner.read().await;
        inner
            .segment_indexes
            .values()
            .filter(|row| row.index_id == index_id && !row.deleted && row.create_ts >= create_ts)
            .map(|row| (row.segment_id, row.state, row.fail_reason.clone()))
            .collect()
    }

    /// Rows indexed so far: sum of `num_rows` over Finished builds of the
    /// given segments.
    pub async fn get_index_build_progress(
        &self,
        index_id: IndexId,
        segment_ids: &[SegmentId],
    ) -> i64 {
        let inner = self.inner.read().await;
        segment_ids
            .iter()
            .filter_map(|segment_id| {
                let build_id = inner.by_segment.get(segment_id)?.get(&index_id)?;
                let row = inner.segment_indexes.get(build_id)?;
                (row.state == IndexState::Finished && !row.deleted).then_some(row.num_rows)
            })
            .sum()
    }

    pub async fn get_index(&self, index_id: IndexId) -> Option<IndexMeta> {
        let inner = self.inner.read().await;
        inner.indexes.get(&index_id).cloned()
    }

    pub async fn get_index_by_name(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> Option<IndexMeta> {
        let inner = self.inner.read().await;
        inner
            .indexes
            .values()
            .find(|meta| {
                meta.collection_id == collection_id
                    && meta.index_name == index_name
                    && !meta.deleted
            })
            .cloned()
    }

    /// All live index definitions on a collection.
    pub async fn get_indexes_for_collection(&self, collection_id: CollectionId) -> Vec<IndexMeta> {
        let inner = self.inner.read().await;
        inner
            .indexes
            .values()
            .filter(|meta| meta.collection_id == collection_id && !meta.deleted)
            .cloned()
            .collect()
    }

    pub async fn get_segment_index(&self, build_id: BuildId) -> Option<SegmentIndex> {
        let inner = self.inner.read().await;
        inner.segment_indexes.get(&build_id).cloned()
    }

    /// Live rows currently in `state`.
    pub async fn segment_indexes_with_state(&self, state: IndexState) -> Vec<SegmentIndex> {
        let inner = self.inner.read().await;
        inner
            .segment_indexes
            .values()
            .filter(|row| row.state == state && !row.deleted)
            .cloned()
            .collect()
    }

    /// Number of live InProgress rows assigned to `node_id`.
    pub async fn in_progress_on_node(&self, node_id: NodeId) -> usize {
        let inner = self.inner.read().await;
        inner
            .segment_indexes
            .values()
            .filter(|row| row.state == IndexState::InProgress && row.node_id == node_id && !row.deleted)
            .count()
    }

    /// Every row belonging to an index, tombstoned or not.
    pub async fn get_segment_indexes_of_index(&self, index_id: IndexId) -> Vec<SegmentIndex> {
        let inner = self.inner.read().await;
        inner
            .segment_indexes
            .values()
            .filter(|row| row.index_id == index_id)
            .cloned()
            .collect()
    }

    /// Builds whose index was dropped while a worker still holds the job.
    pub async fn tombstoned_in_progress(&self) -> Vec<SegmentIndex> {
        let inner = self.inner.read().await;
        inner
            .segment_indexes
            .values()
            .filter(|row| row.deleted && row.state == IndexState::InProgress)
            .cloned()
            .collect()
    }

    /// Tombstoned index definitions, GC input.
    pub async fn get_deleted_indexes(&self) -> Vec<IndexMeta> {
        let inner = self.inner.read().await;
        inner
            .indexes
            .values()
            .filter(|meta| meta.deleted)
            .cloned()
            .collect()
    }

    /// Every known build id, live or tombstoned. Files outside this set are
    /// orphans.
    pub async fn all_build_ids(&self) -> std::collections::HashSet<BuildId> {
        let inner = self.inner.read().await;
        inner.segment_indexes.keys().copied().collect()
    }

    /// All rows, GC input for the unreferenced-segment sweep.
    pub async fn all_segment_indexes(&self) -> Vec<SegmentIndex> {
        let inner = self.inner.read().await;
        inner.segment_indexes.values().cloned().collect()
    }

    /// Hard-remove an index definition row. Only valid once tombstoned.
    pub async fn remove_index_meta(&self, index_id: IndexId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(meta) = inner.indexes.get(&index_id) else {
            return Ok(());
        };
        let key = paths::index_meta(meta.collection_id, meta.index_id);
        self.kv.remove(&key).await?;
        inner.indexes.remove(&index_id);
        Ok(())
    }

    /// Hard-remove a build row.
    pub async fn remove_segment_index(&self, build_id: BuildId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(row) = inner.segment_indexes.get(&build_id) else {
            return Ok(());
        };
        let key = paths::segment_index(row.collection_id, row.partition_id, row.segment_id, row.build_id);
        self.kv.remove(&key).await?;
        inner.drop_segment_index(build_id);
        Ok(())
    }
}
