//! Service discovery and active/standby election over the metadata store
//!
//! Workers and coordinators register sessions as rows under
//! `session/{role}/{nodeID}`; membership changes are observed by watching the
//! role prefix. Election is a single leader key per role claimed with an
//! atomic create; the loser parks as standby and re-campaigns when the key
//! disappears.

use crate::clock::BoundedClock;
use crate::kv::{self, paths, MetaKv, WatchEvent};
use crate::types::NodeId;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One registered session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub node_id: NodeId,
    pub address: String,
    pub register_ts: i64,
}

/// Membership change observed on a role prefix.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Added(SessionRecord),
    Removed { node_id: NodeId },
}

/// Registry of live sessions in the metadata store.
#[derive(Clone)]
pub struct SessionManager {
    kv: Arc<dyn MetaKv>,
    clock: Arc<BoundedClock>,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self {
            kv,
            clock: Arc::new(BoundedClock::default()),
        }
    }

    /// Register a session row for `(role, node_id)`.
    pub async fn register(&self, role: &str, node_id: NodeId, address: &str) -> Result<()> {
        let record = SessionRecord {
            node_id,
            address: address.to_string(),
            register_ts: self.clock.now_nanos(),
        };
        self.kv
            .put(&paths::session(role, node_id), kv::encode(&record)?)
            .await?;
        info!(role, node_id, address, "registered session");
        Ok(())
    }

    /// Remove a session row.
    pub async fn revoke(&self, role: &str, node_id: NodeId) -> Result<()> {
        self.kv.remove(&paths::session(role, node_id)).await?;
        info!(role, node_id, "revoked session");
        Ok(())
    }

    /// List live sessions for a role, plus the revision the listing is
    /// consistent with (watch from `revision + 1`).
    pub async fn list(&self, role: &str) -> Result<(Vec<SessionRecord>, u64)> {
        let (pairs, revision) = self.kv.load_prefix(&paths::session_role(role)).await?;
        let mut sessions = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match kv::decode::<SessionRecord>(&value) {
                Ok(record) => sessions.push(record),
                Err(err) => warn!(%key, %err, "skipping undecodable session row"),
            }
        }
        Ok((sessions, revision))
    }

    /// Watch membership changes for a role starting at `from_revision`.
    pub async fn watch(
        &self,
        role: &str,
        from_revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let prefix = paths::session_role(role);
        let mut raw = self.kv.watch_prefix(&prefix, from_revision).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                let translated = match &event {
                    WatchEvent::Put { key, value, .. } => match kv::decode::<SessionRecord>(value) {
                        Ok(record) => Some(SessionEvent::Added(record)),
                        Err(err) => {
                            warn!(%key, %err, "undecodable session event");
                            None
                        }
                    },
                    WatchEvent::Delete { key, .. } => parse_node_id(key, &prefix)
                        .map(|node_id| SessionEvent::Removed { node_id }),
                };
                if let Some(ev) = translated {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Watch the coordinator's own session row and invoke `on_revoked` if it
    /// disappears from the store. The supervisor is expected to restart the
    /// process.
    pub fn spawn_liveness_check(
        &self,
        role: &str,
        node_id: NodeId,
        token: CancellationToken,
        on_revoked: impl FnOnce() + Send + 'static,
    ) {
        let kv = self.kv.clone();
        let key = paths::session(role, node_id);
        let role = role.to_string();
        tokio::spawn(async move {
            let revision = match kv.current_revision().await {
                Ok(rev) => rev + 1,
                Err(err) => {
                    warn!(%err, "liveness check could not read store revision");
                    return;
                }
            };
            let mut rx = match kv.watch_prefix(&key, revision).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(%err, "liveness check could not watch session key");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(WatchEvent::Delete { .. }) | None => {
                            warn!(%role, node_id, "session revoked, shutting down");
                            on_revoked();
                            return;
                        }
                        Some(WatchEvent::Put { .. }) => {}
                    },
                }
            }
        });
    }
}

fn parse_node_id(key: &str, prefix: &str) -> Option<NodeId> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Coordinator role within an active/standby pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standby,
    Active,
}

/// Leader election over a single `session/{role}-leader` key.
pub struct Election {
    kv: Arc<dyn MetaKv>,
    key: String,
    node_id: NodeId,
}

impl Election {
    pub fn new(kv: Arc<dyn MetaKv>, role: &str, node_id: NodeId) -> Self {
        Self {
            kv,
            key: format!("{}{}-leader", paths::SESSION, role),
            node_id,
        }
    }

    /// Attempt to claim leadership. Returns the resulting role.
    pub async fn campaign(&self) -> Result<Role> {
        let value = kv::encode(&self.node_id)?;
        if self.kv.put_if_absent(&self.key, value).await? {
            info!(node_id = self.node_id, "won election, promoting to active");
            Ok(Role::Active)
        } else {
            info!(node_id = self.node_id, "leader exists, parking as standby");
            Ok(Role::Standby)
        }
    }

    /// Give up leadership (or a pending claim).
    pub async fn resign(&self) -> Result<()> {
        match self.kv.get(&self.key).await? {
            Some(value) if kv::decode::<NodeId>(&value).ok() == Some(self.node_id) => {
                self.kv.remove(&self.key).await
            }
            _ => Ok(()),
        }
    }

    /// Block until this instance is the leader: campaign, and while losing,
    /// wait for the leader key to be deleted before re-campaigning.
    /// Returns `Role::Active`, or `Error::Cancelled` on token cancel.
    pub async fn wait_active(&self, token: &CancellationToken) -> Result<Role> {
        loop {
            if self.campaign().await? == Role::Active {
                return Ok(Role::Active);
            }
            let revision = self.kv.current_revision().await? + 1;
            let mut rx = match self.kv.watch_prefix(&self.key, revision).await {
                Ok(rx) => rx,
                Err(crate::Error::KvCompacted { .. }) => continue,
                Err(err) => return Err(err),
            };
            // the leader may have resigned between campaign and subscribe
            if self.kv.get(&self.key).await?.is_none() {
                continue;
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Err(crate::Error::Cancelled),
                    event = rx.recv() => match event {
                        Some(WatchEvent::Delete { .. }) | None => break,
                        Some(WatchEvent::Put { .. }) => {}
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn test_register_list_watch() {
        let kv = Arc::new(MemoryKv::new());
        let sessions = SessionManager::new(kv.clone());

        sessions.register("index-worker", 10, "10.0.0.1:7041").await.unwrap();
        let (live, revision) = sessions.list("index-worker").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, 10);

        let mut rx = sessions.watch("index-worker", revision + 1).await.unwrap();
        sessions.register("index-worker", 11, "10.0.0.2:7041").await.unwrap();
        sessions.revoke("index-worker", 10).await.unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::Added(record) => assert_eq!(record.node_id, 11),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            SessionEvent::Removed { node_id } => assert_eq!(node_id, 10),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_election_single_winner_and_handover() {
        let kv = Arc::new(MemoryKv::new());
        let first = Election::new(kv.clone(), "coordinator", 1);
        let second = Election::new(kv.clone(), "coordinator", 2);

        assert_eq!(first.campaign().await.unwrap(), Role::Active);
        assert_eq!(second.campaign().await.unwrap(), Role::Standby);

        // standby wins after the leader resigns
        let token = CancellationToken::new();
        let waiter = tokio::spawn({
            let kv = kv.clone();
            let token = token.clone();
            async move {
                let second = Election::new(kv, "coordinator", 2);
                second.wait_active(&token).await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        first.resign().await.unwrap();

        let role = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(role, Role::Active);
    }

    #[tokio::test]
    async fn test_resign_ignores_foreign_leader() {
        let kv = Arc::new(MemoryKv::new());
        let first = Election::new(kv.clone(), "coordinator", 1);
        let second = Election::new(kv.clone(), "coordinator", 2);

        assert_eq!(first.campaign().await.unwrap(), Role::Active);
        second.resign().await.unwrap();
        // leader key still present
        assert_eq!(second.campaign().await.unwrap(), Role::Standby);
    }
}
