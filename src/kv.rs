//! Watched metadata store abstraction
//!
//! The coordinators persist every state transition to a strongly-consistent
//! key-value store and recover by prefix scans on init. This module defines
//! the client trait plus an in-memory backend suitable for development,
//! testing, and single-process deployments; production deployments point the
//! trait at an external store.
//!
//! Watch semantics follow the usual revisioned model: every mutation bumps a
//! store-wide revision, watchers receive all events at or after their start
//! revision, and a start revision older than the compaction floor fails with
//! [`crate::Error::KvCompacted`]. Consumers recover from compaction by a full
//! prefix scan followed by a re-watch at `revision + 1`.

use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tracing::debug;

/// Key prefixes of the persisted state layout.
pub mod paths {
    use crate::types::{BuildId, CollectionId, IndexId, PartitionId, ReplicaId, SegmentId};

    pub const INDEX_META: &str = "index-meta/";
    pub const SEGMENT_INDEX: &str = "segment-index/";
    pub const FLUSHED_SEGMENT: &str = "flushed-segment/";
    pub const HANDOFF: &str = "handoff/";
    pub const COLLECTION_LOAD_INFO: &str = "collection-load-info/";
    pub const PARTITION_LOAD_INFO: &str = "partition-load-info/";
    pub const REPLICA: &str = "replica/";
    pub const SESSION: &str = "session/";

    pub fn index_meta(collection_id: CollectionId, index_id: IndexId) -> String {
        format!("{INDEX_META}{collection_id}/{index_id}")
    }

    pub fn segment_index(
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_id: SegmentId,
        build_id: BuildId,
    ) -> String {
        format!("{SEGMENT_INDEX}{collection_id}/{partition_id}/{segment_id}/{build_id}")
    }

    pub fn flushed_segment(
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_id: SegmentId,
    ) -> String {
        format!("{FLUSHED_SEGMENT}{collection_id}/{partition_id}/{segment_id}")
    }

    pub fn handoff(
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_id: SegmentId,
    ) -> String {
        format!("{HANDOFF}{collection_id}/{partition_id}/{segment_id}")
    }

    pub fn collection_load_info(collection_id: CollectionId) -> String {
        format!("{COLLECTION_LOAD_INFO}{collection_id}")
    }

    pub fn partition_load_info(collection_id: CollectionId, partition_id: PartitionId) -> String {
        format!("{PARTITION_LOAD_INFO}{collection_id}/{partition_id}")
    }

    pub fn replica(collection_id: CollectionId, replica_id: ReplicaId) -> String {
        format!("{REPLICA}{collection_id}/{replica_id}")
    }

    pub fn session(role: &str, node_id: i64) -> String {
        format!("{SESSION}{role}/{node_id}")
    }

    pub fn session_role(role: &str) -> String {
        format!("{SESSION}{role}/")
    }
}

/// Schema tag byte prepended to every persisted value.
pub const SCHEMA_VERSION: u8 = 1;

/// Encode a persisted record as a versioned serialized value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    buf.push(SCHEMA_VERSION);
    serde_json::to_writer(&mut buf, value)?;
    Ok(buf)
}

/// Decode a persisted record, checking its schema tag.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&SCHEMA_VERSION, rest)) => Ok(serde_json::from_slice(rest)?),
        Some((other, _)) => Err(crate::Error::Serialization(format!(
            "unsupported schema version {other}"
        ))),
        None => Err(crate::Error::Serialization("empty value".to_string())),
    }
}

/// An event observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put {
        key: String,
        value: Vec<u8>,
        revision: u64,
    },
    Delete {
        key: String,
        revision: u64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            WatchEvent::Put { revision, .. } | WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Metadata store client interface.
///
/// This trait abstracts the metadata storage backend, allowing for
/// different implementations (in-memory for dev, an external store for prod).
#[async_trait]
pub trait MetaKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Write the key only if it does not exist. Returns whether the write won.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Apply a batch of puts. The batch is ordered so that re-running it after
    /// a partial failure is safe; atomicity across keys is not assumed.
    async fn multi_put(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn multi_remove(&self, keys: Vec<String>) -> Result<()>;

    /// Scan all keys under a prefix. Returns the pairs and the store revision
    /// the scan is consistent with; watch from `revision + 1` to observe every
    /// later change.
    async fn load_prefix(&self, prefix: &str) -> Result<(Vec<(String, Vec<u8>)>, u64)>;

    async fn remove_prefix(&self, prefix: &str) -> Result<()>;

    /// Subscribe to changes under a prefix starting at `from_revision`.
    /// The stream ends when the store cancels the watch (e.g. on compaction);
    /// re-subscribe from the last seen revision + 1.
    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    async fn current_revision(&self) -> Result<u64>;
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct MemoryKvInner {
    data: BTreeMap<String, Vec<u8>>,
    revision: u64,
    /// Oldest revision still present in the event log
    earliest: u64,
    log: VecDeque<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl MemoryKvInner {
    fn apply(&mut self, event: WatchEvent) {
        match &event {
            WatchEvent::Put { key, value, .. } => {
                self.data.insert(key.clone(), value.clone());
            }
            WatchEvent::Delete { key, .. } => {
                self.data.remove(key);
            }
        }
        self.watchers
            .retain(|w| !event.key().starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
        self.log.push_back(event);
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// In-memory metadata store backend.
///
/// Strongly consistent by construction: all mutations and watch fanout happen
/// under one write lock, so a watcher started at revision `r` sees exactly the
/// mutations after `r` in commit order.
pub struct MemoryKv {
    inner: RwLock<MemoryKvInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryKvInner {
                data: BTreeMap::new(),
                revision: 0,
                earliest: 1,
                log: VecDeque::new(),
                watchers: Vec::new(),
            }),
        }
    }

    /// Discard the event log up to `revision` and cancel active watches,
    /// as a store would on compaction. Watch consumers must re-subscribe
    /// and handle [`crate::Error::KvCompacted`].
    pub fn compact(&self, revision: u64) {
        let mut inner = self.inner.write();
        // the floor can never pass the next unassigned revision
        let revision = revision.min(inner.revision + 1);
        while inner
            .log
            .front()
            .map(|e| e.revision() < revision)
            .unwrap_or(false)
        {
            inner.log.pop_front();
        }
        inner.earliest = inner.earliest.max(revision);
        inner.watchers.clear();
        debug!(revision, "compacted kv event log");
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write();
        let revision = inner.next_revision();
        inner.apply(WatchEvent::Put {
            key: key.to_string(),
            value,
            revision,
        });
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.data.contains_key(key) {
            return Ok(false);
        }
        let revision = inner.next_revision();
        inner.apply(WatchEvent::Put {
            key: key.to_string(),
            value,
            revision,
        });
        Ok(true)
    }

    async fn multi_put(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut inner = self.inner.write();
        for (key, value) in kvs {
            let revision = inner.next_revision();
            inner.apply(WatchEvent::Put {
                key,
                value,
                revision,
            });
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.data.contains_key(key) {
            let revision = inner.next_revision();
            inner.apply(WatchEvent::Delete {
                key: key.to_string(),
                revision,
            });
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write();
        for key in keys {
            if inner.data.contains_key(&key) {
                let revision = inner.next_revision();
                inner.apply(WatchEvent::Delete { key, revision });
            }
        }
        Ok(())
    }

    async fn load_prefix(&self, prefix: &str) -> Result<(Vec<(String, Vec<u8>)>, u64)> {
        let inner = self.inner.read();
        let pairs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok((pairs, inner.revision))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<()> {
        let keys: Vec<String> = {
            let inner = self.inner.read();
            inner
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect()
        };
        self.multi_remove(keys).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut inner = self.inner.write();
        if from_revision < inner.earliest {
            return Err(crate::Error::KvCompacted {
                requested: from_revision,
                earliest: inner.earliest,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for event in inner.log.iter() {
            if event.revision() >= from_revision && event.key().starts_with(prefix) {
                // receiver can't be dropped yet, send can't fail
                let _ = tx.send(event.clone());
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn current_revision(&self) -> Result<u64> {
        Ok(self.inner.read().revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let kv = MemoryKv::new();
        kv.put("a/1", b"one".to_vec()).await.unwrap();
        kv.put("a/2", b"two".to_vec()).await.unwrap();
        kv.put("b/1", b"other".to_vec()).await.unwrap();

        assert_eq!(kv.get("a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(kv.get("missing").await.unwrap(), None);

        let (pairs, rev) = kv.load_prefix("a/").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(rev, 3);

        kv.remove("a/1").await.unwrap();
        assert_eq!(kv.get("a/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_replay_and_live_events() {
        let kv = MemoryKv::new();
        kv.put("seg/1", b"x".to_vec()).await.unwrap();

        let mut rx = kv.watch_prefix("seg/", 1).await.unwrap();
        // replayed
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key(), "seg/1");
        assert_eq!(ev.revision(), 1);

        // live
        kv.put("seg/2", b"y".to_vec()).await.unwrap();
        kv.put("other/1", b"z".to_vec()).await.unwrap();
        kv.remove("seg/1").await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.key(), "seg/2");
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, WatchEvent::Delete { .. }));
        assert_eq!(ev.key(), "seg/1");
    }

    #[tokio::test]
    async fn test_compaction_rejects_stale_watch() {
        let kv = MemoryKv::new();
        for i in 0..10 {
            kv.put(&format!("seg/{i}"), vec![i as u8]).await.unwrap();
        }
        kv.compact(5);

        let err = kv.watch_prefix("seg/", 1).await.unwrap_err();
        match err {
            crate::Error::KvCompacted {
                requested,
                earliest,
            } => {
                assert_eq!(requested, 1);
                assert_eq!(earliest, 5);
            }
            other => panic!("unexpected error: {other}"),
        }

        // re-watch after full reload works
        let (_, rev) = kv.load_prefix("seg/").await.unwrap();
        assert!(kv.watch_prefix("seg/", rev + 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_compaction_severs_active_watches() {
        let kv = MemoryKv::new();
        let mut rx = kv.watch_prefix("seg/", 1).await.unwrap();
        kv.compact(1);
        kv.put("seg/1", b"x".to_vec()).await.unwrap();
        // the watcher was cancelled, so the channel is closed
        assert!(rx.recv().await.is_none());
    }
}
