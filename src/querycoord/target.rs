//! Desired-state targets
//!
//! Per collection, two snapshots of `(segments, channels)`: `Current` is what
//! the observers converge toward, `Next` is staged whenever recovery info is
//! refreshed from the data plane. Promotion `Next -> Current` is atomic per
//! collection. Snapshots are immutable behind `Arc`, so readers never block
//! writers; lookups hand out copies.

use crate::cluster::worker::DataCoord;
use crate::types::{CollectionId, DmChannel, SegmentId, SegmentInfo};
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Which snapshot a lookup reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    Current,
    Next,
}

#[derive(Debug, Default)]
struct CollectionTarget {
    segments: HashMap<SegmentId, SegmentInfo>,
    channels: HashMap<String, DmChannel>,
}

#[derive(Default)]
struct TargetPair {
    current: Option<Arc<CollectionTarget>>,
    next: Option<Arc<CollectionTarget>>,
}

pub struct TargetManager {
    broker: Arc<dyn DataCoord>,
    targets: RwLock<HashMap<CollectionId, TargetPair>>,
}

impl TargetManager {
    pub fn new(broker: Arc<dyn DataCoord>) -> Self {
        Self {
            broker,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Pull recovery info from the data plane and stage it as `Next`.
    pub async fn update_collection_next_target(&self, collection_id: CollectionId) -> Result<()> {
        let info = self.broker.get_recovery_info(collection_id).await?;
        let target = CollectionTarget {
            segments: info
                .segments
                .into_iter()
                .map(|s| (s.segment_id, s))
                .collect(),
            channels: info
                .channels
                .into_iter()
                .map(|c| (c.channel_name.clone(), c))
                .collect(),
        };
        debug!(
            collection_id,
            segments = target.segments.len(),
            channels = target.channels.len(),
            "staged next target"
        );
        self.targets
            .write()
            .entry(collection_id)
            .or_default()
            .next = Some(Arc::new(target));
        Ok(())
    }

    /// Atomically promote `Next -> Current`, clearing `Next`. A no-op when
    /// nothing is staged.
    pub fn update_collection_current_target(&self, collection_id: CollectionId) {
        let mut targets = self.targets.write();
        let Some(pair) = targets.get_mut(&collection_id) else {
            return;
        };
        if let Some(next) = pair.next.take() {
            info!(collection_id, "promoted next target to current");
            pair.current = Some(next);
        }
    }

    pub fn remove_collection(&self, collection_id: CollectionId) {
        self.targets.write().remove(&collection_id);
    }

    fn snapshot(
        &self,
        collection_id: CollectionId,
        scope: TargetScope,
    ) -> Option<Arc<CollectionTarget>> {
        let targets = self.targets.read();
        let pair = targets.get(&collection_id)?;
        match scope {
            TargetScope::Current => pair.current.clone(),
            TargetScope::Next => pair.next.clone(),
        }
    }

    pub fn get_segments(&self, collection_id: CollectionId, scope: TargetScope) -> Vec<SegmentInfo> {
        self.snapshot(collection_id, scope)
            .map(|t| t.segments.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_segment(
        &self,
        collection_id: CollectionId,
        segment_id: SegmentId,
        scope: TargetScope,
    ) -> Option<SegmentInfo> {
        self.snapshot(collection_id, scope)?
            .segments
            .get(&segment_id)
            .cloned()
    }

    pub fn get_channels(&self, collection_id: CollectionId, scope: TargetScope) -> Vec<DmChannel> {
        self.snapshot(collection_id, scope)
            .map(|t| t.channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_target(&self, collection_id: CollectionId, scope: TargetScope) -> bool {
        self.snapshot(collection_id, scope).is_some()
    }
}
