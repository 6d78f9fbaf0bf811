//! ChatRouter: resolve a push target against the registry and deliver.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::registry::{PeerRecord, PeerRegistry};

/// Where an operator push goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    /// 1-based position in the most recent listing.
    Index(usize),
    /// Exact `ip:port` display address.
    Address(String),
}

/// Outcome of a single targeted push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { addr: String },
    /// Target resolved but its session already ended; nothing was sent.
    PeerGone { addr: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid index {index}: {count} peer(s) listed")]
    InvalidIndex { index: usize, count: usize },
    #[error("peer {0} not found")]
    AddressNotFound(String),
}

pub struct ChatRouter {
    registry: PeerRegistry,
    /// Listing that index addressing refers to.
    last_listing: Mutex<Option<Vec<PeerRecord>>>,
}

impl ChatRouter {
    pub fn new(registry: PeerRegistry) -> Self {
        Self {
            registry,
            last_listing: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Fresh snapshot; later index lookups refer to this ordering.
    pub async fn list(&self) -> Vec<PeerRecord> {
        let snapshot = self.registry.snapshot().await;
        *self.last_listing.lock().await = Some(snapshot.clone());
        snapshot
    }

    /// Push to every connected peer. Returns how many accepted it.
    pub async fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for peer in self.registry.snapshot().await {
            if let Delivery::Delivered { .. } = deliver(&peer, text) {
                delivered += 1;
            }
        }
        debug!(delivered, "broadcast");
        delivered
    }

    pub async fn send_by_index(&self, index: usize, text: &str) -> Result<Delivery, RouteError> {
        let mut listing = self.last_listing.lock().await;
        if listing.is_none() {
            *listing = Some(self.registry.snapshot().await);
        }
        let peers = listing.as_deref().unwrap_or_default();
        let peer = index
            .checked_sub(1)
            .and_then(|i| peers.get(i))
            .ok_or(RouteError::InvalidIndex {
                index,
                count: peers.len(),
            })?;
        Ok(deliver(peer, text))
    }

    pub async fn send_by_address(&self, addr: &str, text: &str) -> Result<Delivery, RouteError> {
        let peer = self
            .registry
            .find(|p| p.addr == addr)
            .await
            .ok_or_else(|| RouteError::AddressNotFound(addr.to_string()))?;
        Ok(deliver(&peer, text))
    }

    /// Dispatch on a parsed target. `All` reports one delivery per peer reached.
    pub async fn send(&self, target: &Target, text: &str) -> Result<Vec<Delivery>, RouteError> {
        match target {
            Target::All => {
                let mut out = Vec::new();
                for peer in self.registry.snapshot().await {
                    out.push(deliver(&peer, text));
                }
                Ok(out)
            }
            Target::Index(i) => self.send_by_index(*i, text).await.map(|d| vec![d]),
            Target::Address(a) => self.send_by_address(a, text).await.map(|d| vec![d]),
        }
    }
}

fn deliver(peer: &PeerRecord, text: &str) -> Delivery {
    if peer.push(text) {
        Delivery::Delivered {
            addr: peer.addr.clone(),
        }
    } else {
        warn!(peer = %peer.addr, "push to disconnected peer dropped");
        Delivery::PeerGone {
            addr: peer.addr.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PushReceiver;

    async fn registry_with(addrs: &[&str]) -> (PeerRegistry, Vec<PushReceiver>) {
        let registry = PeerRegistry::new();
        let mut boxes = Vec::new();
        for addr in addrs {
            let (record, rx) = PeerRecord::with_mailbox(*addr);
            registry.register(record).await;
            boxes.push(rx);
        }
        (registry, boxes)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_live_peer() {
        let (registry, mut boxes) = registry_with(&["a:1", "b:2", "c:3"]).await;
        let dead = boxes.remove(1);
        drop(dead);
        let router = ChatRouter::new(registry);
        assert_eq!(router.broadcast("hello").await, 2);
        for rx in boxes.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), "hello");
        }
    }

    #[tokio::test]
    async fn index_follows_last_listing() {
        let (registry, mut boxes) = registry_with(&["a:1", "b:2"]).await;
        let router = ChatRouter::new(registry.clone());
        let listing = router.list().await;
        assert_eq!(listing.len(), 2);

        // A peer joining after the listing does not shift indices.
        let (late, _late_rx) = PeerRecord::with_mailbox("z:9");
        registry.register(late).await;

        let d = router.send_by_index(2, "to b").await.unwrap();
        assert_eq!(d, Delivery::Delivered { addr: "b:2".into() });
        assert_eq!(boxes[1].try_recv().unwrap(), "to b");
        assert!(boxes[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_range_index_delivers_nothing() {
        let (registry, mut boxes) = registry_with(&["a:1"]).await;
        let router = ChatRouter::new(registry);
        router.list().await;
        assert_eq!(
            router.send_by_index(2, "x").await,
            Err(RouteError::InvalidIndex { index: 2, count: 1 })
        );
        assert_eq!(
            router.send_by_index(0, "x").await,
            Err(RouteError::InvalidIndex { index: 0, count: 1 })
        );
        assert!(boxes[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn address_must_match_exactly() {
        let (registry, mut boxes) = registry_with(&["127.0.0.1:5000"]).await;
        let router = ChatRouter::new(registry);
        assert_eq!(
            router.send_by_address("127.0.0.1:500", "x").await,
            Err(RouteError::AddressNotFound("127.0.0.1:500".into()))
        );
        let d = router.send_by_address("127.0.0.1:5000", "hi").await.unwrap();
        assert!(matches!(d, Delivery::Delivered { .. }));
        assert_eq!(boxes[0].try_recv().unwrap(), "hi");
    }

    #[tokio::test]
    async fn departed_peer_in_listing_is_a_noop() {
        let (registry, boxes) = registry_with(&["a:1"]).await;
        let router = ChatRouter::new(registry);
        router.list().await;
        drop(boxes);
        let d = router.send_by_index(1, "x").await.unwrap();
        assert_eq!(d, Delivery::PeerGone { addr: "a:1".into() });
    }
}
