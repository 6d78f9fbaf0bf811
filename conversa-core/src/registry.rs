//! PeerRegistry: connected peers in insertion order, each with a push handle.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Sending half of a session's push mailbox.
pub type PushSender = mpsc::UnboundedSender<String>;
/// Receiving half, drained by the session that owns the connection.
pub type PushReceiver = mpsc::UnboundedReceiver<String>;

/// Opaque peer identity, unique per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// One connected peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Display address, `ip:port`.
    pub addr: String,
    sender: PushSender,
}

impl PeerRecord {
    /// New record plus the mailbox its session must drain.
    pub fn with_mailbox(addr: impl Into<String>) -> (Self, PushReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let record = Self {
            id: PeerId::new(),
            addr: addr.into(),
            sender: tx,
        };
        (record, rx)
    }

    /// False once the owning session has dropped its mailbox.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue a push line. Returns false if the session is gone.
    pub fn push(&self, text: &str) -> bool {
        self.sender.send(text.to_string()).is_ok()
    }
}

/// Shared table of connected peers. Clones share the same table; every
/// access holds the lock only for the copy or mutation itself.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<Vec<PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, record: PeerRecord) {
        self.peers.lock().await.push(record);
    }

    pub async fn unregister(&self, id: PeerId) -> Option<PeerRecord> {
        let mut peers = self.peers.lock().await;
        let pos = peers.iter().position(|p| p.id == id)?;
        Some(peers.remove(pos))
    }

    /// Point-in-time copy, insertion order preserved.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.lock().await.clone()
    }

    pub async fn find<F>(&self, predicate: F) -> Option<PeerRecord>
    where
        F: Fn(&PeerRecord) -> bool,
    {
        self.peers.lock().await.iter().find(|p| predicate(p)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
