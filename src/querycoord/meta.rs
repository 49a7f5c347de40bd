//! Query-side load metadata
//!
//! Collections, partitions, and replicas that should be loaded, with their
//! observed load progress. Write-through to the metadata store in the same
//! style as the index MetaTable; recovered by prefix scan on init and on
//! standby promotion.

use crate::clock::{BoundedClock, IdAllocator};
use crate::kv::{self, paths, MetaKv};
use crate::types::{CollectionId, NodeId, PartitionId, ReplicaId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadType {
    Collection,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Loading,
    Loaded,
    Failed,
}

/// One collection's load intent and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub collection_id: CollectionId,
    pub replica_number: usize,
    pub load_percentage: i32,
    pub status: LoadStatus,
    pub load_type: LoadType,
    /// Load request time (nanos); the timeout clock starts here
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub created_at: i64,
}

/// A group of workers holding one logical copy of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub collection_id: CollectionId,
    pub node_ids: Vec<NodeId>,
}

impl Replica {
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.node_ids.contains(&node_id)
    }
}

#[derive(Default)]
struct MetaInner {
    collections: HashMap<CollectionId, CollectionInfo>,
    partitions: HashMap<(CollectionId, PartitionId), PartitionInfo>,
    replicas: HashMap<ReplicaId, Replica>,
}

/// Authoritative load configuration, shared read-only with the balancer.
pub struct Meta {
    kv: Arc<dyn MetaKv>,
    clock: Arc<BoundedClock>,
    replica_ids: IdAllocator,
    inner: RwLock<MetaInner>,
}

impl Meta {
    pub async fn new(kv: Arc<dyn MetaKv>, clock: Arc<BoundedClock>) -> Result<Self> {
        let meta = Self {
            kv,
            clock,
            replica_ids: IdAllocator::default(),
            inner: RwLock::new(MetaInner::default()),
        };
        meta.reload_from_kv().await?;
        Ok(meta)
    }

    pub async fn reload_from_kv(&self) -> Result<()> {
        let mut fresh = MetaInner::default();

        let (pairs, _) = self.kv.load_prefix(paths::COLLECTION_LOAD_INFO).await?;
        for (_, value) in pairs {
            let info: CollectionInfo = kv::decode(&value)?;
            fresh.collections.insert(info.collection_id, info);
        }
        let (pairs, _) = self.kv.load_prefix(paths::PARTITION_LOAD_INFO).await?;
        for (_, value) in pairs {
            let info: PartitionInfo = kv::decode(&value)?;
            fresh
                .partitions
                .insert((info.collection_id, info.partition_id), info);
        }
        let (pairs, _) = self.kv.load_prefix(paths::REPLICA).await?;
        for (_, value) in pairs {
            let replica: Replica = kv::decode(&value)?;
            self.replica_ids.observe(replica.id);
            fresh.replicas.insert(replica.id, replica);
        }

        let mut inner = self.inner.write().await;
        info!(
            collections = fresh.collections.len(),
            replicas = fresh.replicas.len(),
            "query meta recovered from store"
        );
        *inner = fresh;
        Ok(())
    }

    /// Record a new Loading collection.
    pub async fn put_collection(
        &self,
        collection_id: CollectionId,
        replica_number: usize,
        load_type: LoadType,
    ) -> Result<CollectionInfo> {
        let info = CollectionInfo {
            collection_id,
            replica_number,
            load_percentage: 0,
            status: LoadStatus::Loading,
            load_type,
            created_at: self.clock.now_nanos(),
        };
        let mut inner = self.inner.write().await;
        self.kv
            .put(
                &paths::collection_load_info(collection_id),
                kv::encode(&info)?,
            )
            .await?;
        inner.collections.insert(collection_id, info.clone());
        Ok(info)
    }

    pub async fn put_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<()> {
        let info = PartitionInfo {
            collection_id,
            partition_id,
            created_at: self.clock.now_nanos(),
        };
        let mut inner = self.inner.write().await;
        self.kv
            .put(
                &paths::partition_load_info(collection_id, partition_id),
                kv::encode(&info)?,
            )
            .await?;
        inner.partitions.insert((collection_id, partition_id), info);
        Ok(())
    }

    pub async fn get_collection(&self, collection_id: CollectionId) -> Option<CollectionInfo> {
        self.inner.read().await.collections.get(&collection_id).cloned()
    }

    pub async fn exist(&self, collection_id: CollectionId) -> bool {
        self.inner.read().await.collections.contains_key(&collection_id)
    }

    pub async fn collections(&self) -> Vec<CollectionInfo> {
        self.inner.read().await.collections.values().cloned().collect()
    }

    pub async fn partitions_of(&self, collection_id: CollectionId) -> Vec<PartitionInfo> {
        self.inner
            .read()
            .await
            .partitions
            .values()
            .filter(|p| p.collection_id == collection_id)
            .cloned()
            .collect()
    }

    /// Persist observed load progress; 100 flips the status to Loaded.
    pub async fn update_load_percentage(
        &self,
        collection_id: CollectionId,
        percentage: i32,
    ) -> Result<CollectionInfo> {
        let mut inner = self.inner.write().await;
        let info = inner
            .collections
            .get(&collection_id)
            .ok_or(Error::CollectionNotFound(collection_id))?;
        let mut updated = info.clone();
        updated.load_percentage = percentage;
        if percentage >= 100 {
            updated.load_percentage = 100;
            updated.status = LoadStatus::Loaded;
        }
        self.kv
            .put(
                &paths::collection_load_info(collection_id),
                kv::encode(&updated)?,
            )
            .await?;
        inner.collections.insert(collection_id, updated.clone());
        Ok(updated)
    }

    /// Drop the collection's load info, partitions, and replicas, store
    /// first.
    pub async fn remove_collection(&self, collection_id: CollectionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.kv
            .remove(&paths::collection_load_info(collection_id))
            .await?;
        self.kv
            .remove_prefix(&format!("{}{}/", paths::PARTITION_LOAD_INFO, collection_id))
            .await?;
        self.kv
            .remove_prefix(&format!("{}{}/", paths::REPLICA, collection_id))
            .await?;
        inner.collections.remove(&collection_id);
        inner.partitions.retain(|_, p| p.collection_id != collection_id);
        inner.replicas.retain(|_, r| r.collection_id != collection_id);
        info!(collection_id, "removed collection load meta");
        Ok(())
    }

    pub async fn remove_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.kv
            .remove(&paths::partition_load_info(collection_id, partition_id))
            .await?;
        inner.partitions.remove(&(collection_id, partition_id));
        Ok(())
    }

    /// Carve the available workers into replica groups of `replica_number`
    /// nodes each. Every node lands in at most one replica of the
    /// collection; workers that don't fill a whole group are left out.
    pub async fn allocate_replicas(
        &self,
        collection_id: CollectionId,
        replica_number: usize,
        mut available_nodes: Vec<NodeId>,
    ) -> Result<Vec<Replica>> {
        if replica_number == 0 {
            return Err(Error::Config("replica_number must be positive".to_string()));
        }
        if available_nodes.len() < replica_number {
            return Err(Error::NotEnoughNodes {
                want: replica_number,
                have: available_nodes.len(),
            });
        }
        available_nodes.sort_unstable();

        let mut inner = self.inner.write().await;
        let mut replicas = Vec::new();
        let mut batch = Vec::new();
        for group in available_nodes.chunks_exact(replica_number) {
            let replica = Replica {
                id: self.replica_ids.alloc(),
                collection_id,
                node_ids: group.to_vec(),
            };
            batch.push((
                paths::replica(collection_id, replica.id),
                kv::encode(&replica)?,
            ));
            replicas.push(replica);
        }
        self.kv.multi_put(batch).await?;
        for replica in &replicas {
            debug!(replica_id = replica.id, nodes = ?replica.node_ids, "allocated replica");
            inner.replicas.insert(replica.id, replica.clone());
        }
        Ok(replicas)
    }

    pub async fn replicas_of(&self, collection_id: CollectionId) -> Vec<Replica> {
        self.inner
            .read()
            .await
            .replicas
            .values()
            .filter(|r| r.collection_id == collection_id)
            .cloned()
            .collect()
    }

    pub async fn get_replica(&self, replica_id: ReplicaId) -> Option<Replica> {
        self.inner.read().await.replicas.get(&replica_id).cloned()
    }

    /// The replica of `collection_id` that `node_id` serves, if any.
    pub async fn replica_for_node(
        &self,
        collection_id: CollectionId,
        node_id: NodeId,
    ) -> Option<Replica> {
        self.inner
            .read()
            .await
            .replicas
            .values()
            .find(|r| r.collection_id == collection_id && r.contains(node_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    async fn meta() -> (Arc<MemoryKv>, Meta) {
        let kv = Arc::new(MemoryKv::new());
        let meta = Meta::new(kv.clone(), Arc::new(BoundedClock::default()))
            .await
            .unwrap();
        (kv, meta)
    }

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let (_, meta) = meta().await;
        meta.put_collection(101, 1, LoadType::Collection).await.unwrap();
        assert!(meta.exist(101).await);

        let info = meta.update_load_percentage(101, 50).await.unwrap();
        assert_eq!(info.status, LoadStatus::Loading);

        let info = meta.update_load_percentage(101, 100).await.unwrap();
        assert_eq!(info.status, LoadStatus::Loaded);
        assert_eq!(info.load_percentage, 100);

        meta.remove_collection(101).await.unwrap();
        assert!(!meta.exist(101).await);
    }

    #[tokio::test]
    async fn test_replica_allocation_invariants() {
        let (_, meta) = meta().await;
        let replicas = meta.allocate_replicas(101, 2, vec![4, 1, 2, 3]).await.unwrap();
        assert_eq!(replicas.len(), 2);

        let mut seen = std::collections::HashSet::new();
        for replica in &replicas {
            assert_eq!(replica.node_ids.len(), 2);
            for node in &replica.node_ids {
                assert!(seen.insert(*node), "node {node} in two replicas");
            }
        }

        assert!(matches!(
            meta.allocate_replicas(102, 3, vec![1, 2]).await,
            Err(Error::NotEnoughNodes { want: 3, have: 2 })
        ));
    }

    #[tokio::test]
    async fn test_replica_lookup_by_node() {
        let (_, meta) = meta().await;
        meta.allocate_replicas(101, 2, vec![1, 2]).await.unwrap();
        assert!(meta.replica_for_node(101, 2).await.is_some());
        assert!(meta.replica_for_node(101, 9).await.is_none());
    }

    #[tokio::test]
    async fn test_recovery_reproduces_meta() {
        let (kv, meta) = meta().await;
        meta.put_collection(101, 1, LoadType::Collection).await.unwrap();
        meta.put_partition(101, 7).await.unwrap();
        meta.allocate_replicas(101, 1, vec![1]).await.unwrap();
        meta.update_load_percentage(101, 100).await.unwrap();

        let recovered = Meta::new(kv, Arc::new(BoundedClock::default())).await.unwrap();
        assert_eq!(
            recovered.get_collection(101).await,
            meta.get_collection(101).await
        );
        assert_eq!(recovered.partitions_of(101).await.len(), 1);
        assert_eq!(recovered.replicas_of(101).await, meta.replicas_of(101).await);
    }
}
