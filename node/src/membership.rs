use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use utilities::{
    discovery::DiscoveredPeer,
    event_queue::EventQueue,
    logger::{info, instrument, trace, tracing, warn},
    ring::{NodeInfo, Ring},
};

use crate::ownership::{OwnershipDecision, OwnershipManager};

/// Turns discovery announcements into ring membership. When a newcomer
/// becomes this node's successor the local files are re-evaluated.
pub struct Membership {
    node_name: String,
    self_id: NodeInfo,
    ring: Arc<Mutex<Ring>>,
    manager: Arc<OwnershipManager>,
}

impl Membership {
    pub fn new(node_name: impl Into<String>, ring: Arc<Mutex<Ring>>, manager: Arc<OwnershipManager>) -> Self {
        Self {
            node_name: node_name.into(),
            self_id: manager.self_id().clone(),
            ring,
            manager,
        }
    }

    /// Adds an announced peer to the ring. Returns the recheck outcome when
    /// the successor changed, `None` otherwise.
    #[instrument(name = "membership_handle_peer", skip_all, fields(name = %peer.name, address = %peer.address))]
    pub async fn handle_peer(&self, peer: DiscoveredPeer) -> Option<Vec<OwnershipDecision>> {
        let node = NodeInfo::new(&peer.name, peer.address.to_string());
        // our own datagrams may arrive from an address other than the
        // advertised one
        if peer.name == self.node_name || node == self.self_id {
            trace!("own announcement");
            return None;
        }
        let next = {
            let mut ring = self.ring.lock().await;
            if ring.nodes().any(|n| n == &node && n.hash() == node.hash()) {
                trace!("peer already known");
                return None;
            }
            let before = ring.successor(&self.self_id).cloned();
            if let Some(replaced) = ring.insert(node.clone()) {
                if replaced != node {
                    warn!(replaced = %replaced.address(), position = node.hash(), "Ring position collision, newcomer replaces occupant");
                }
            }
            info!(position = node.hash(), members = ring.len(), "Peer joined the ring");
            let after = ring.successor(&self.self_id).cloned();
            match after {
                Some(next) if before.as_ref() != Some(&next) => next,
                _ => return None,
            }
        };
        info!(next = %next.address(), "Successor changed, rechecking ownership");
        Some(self.manager.recheck_ownership(&next).await)
    }

    pub fn spawn(self, queue: &EventQueue<DiscoveredPeer>) -> JoinHandle<()> {
        let membership = Arc::new(self);
        queue.spawn_listener(move |queue| {
            let membership = membership.clone();
            async move {
                while let Some(peer) = queue.poll().await {
                    membership.handle_peer(peer).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file_watch::FileWatch,
        nameserver::NameResolver,
        ownership::Placement,
        peer::{PeerHandle, PeerRegistry},
    };
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use storage::file_storage::FileStorage;
    use utilities::{error::RemoteError, ring::FileInfo};

    struct NoResolver;

    #[async_trait]
    impl NameResolver for NoResolver {
        async fn find_location_file(&self, _file_name: &str) -> Result<NodeInfo, RemoteError> {
            Err(RemoteError::Rejected("no nodes".to_owned()))
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl PeerHandle for AcceptAll {
        async fn request_download(&self, _requester: &NodeInfo, _file_name: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_owner_file(&self, _file_info: &FileInfo) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    impl PeerRegistry for AcceptAll {
        fn lookup(&self, _address: &str) -> Box<dyn PeerHandle> {
            Box::new(AcceptAll)
        }
    }

    fn announced(name: &str, address: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            name: name.to_owned(),
            address: address.parse::<SocketAddr>().unwrap(),
        }
    }

    // "A" sits at 65, "(" at 40, "_" at 95
    async fn membership_for(name: &str, files: &[&str]) -> (tempfile::TempDir, Membership) {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            std::fs::write(dir.path().join(file), b"x").unwrap();
        }
        let self_id = NodeInfo::new(name, "127.0.0.1:7100");
        let manager = OwnershipManager::new(
            self_id.clone(),
            FileWatch::new(FileStorage::new(dir.path()).unwrap()),
            Arc::new(NoResolver),
            Arc::new(AcceptAll),
        )
        .await
        .unwrap();
        let mut ring = Ring::new();
        ring.insert(self_id);
        (dir, Membership::new(name, Arc::new(Mutex::new(ring)), Arc::new(manager)))
    }

    #[tokio::test]
    async fn own_and_repeated_announcements_are_ignored() {
        let (_dir, membership) = membership_for("(", &[]).await;
        assert!(membership.handle_peer(announced("(", "127.0.0.1:7100")).await.is_none());
        assert!(membership.handle_peer(announced("(", "192.168.1.4:7100")).await.is_none());
        assert!(membership.handle_peer(announced("_", "127.0.0.1:7200")).await.is_some());
        assert!(membership.handle_peer(announced("_", "127.0.0.1:7200")).await.is_none());
        assert_eq!(membership.ring.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn new_successor_triggers_recheck() {
        let (_dir, membership) = membership_for("(", &["A"]).await;
        // 95 becomes the successor of 40, the file at 65 moves
        let decisions = membership
            .handle_peer(announced("_", "127.0.0.1:7200"))
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].placement, Placement::HandedOff);

        // 65 sits between 40 and 95 and takes over as successor
        let decisions = membership
            .handle_peer(announced("A", "127.0.0.1:7300"))
            .await
            .unwrap();
        assert_eq!(decisions[0].placement, Placement::HandedOff);
    }

    #[tokio::test]
    async fn peer_that_is_not_successor_changes_nothing() {
        let (_dir, membership) = membership_for("(", &[]).await;
        membership.handle_peer(announced("A", "127.0.0.1:7200")).await;
        // 95 lands after 65, successor of 40 stays 65
        assert!(membership.handle_peer(announced("_", "127.0.0.1:7300")).await.is_none());
        assert_eq!(membership.ring.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn spawned_listener_fills_the_ring() {
        let (_dir, membership) = membership_for("(", &[]).await;
        let ring = membership.ring.clone();
        let queue = EventQueue::new();
        let handle = membership.spawn(&queue);
        queue.add(announced("A", "127.0.0.1:7200")).await;
        queue.add(announced("_", "127.0.0.1:7300")).await;
        queue.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ring.lock().await.len(), 3);
    }
}
