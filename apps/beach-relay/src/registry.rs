use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::extract::ws::Message;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Identifies one relay session instance, independent of the peer id it claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound handle for a peer. Frames are queued for the peer's writer task,
/// which is the only place its socket is written from.
#[derive(Debug, Clone)]
pub struct PeerSender {
    tx: mpsc::Sender<Message>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendFailure {
    #[error("peer outbound queue is full")]
    Full,
    #[error("peer writer has shut down")]
    Closed,
}

impl PeerSender {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Creates a sender together with the receiving half its writer drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn try_send(&self, frame: Message) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    #[cfg(test)]
    fn same_channel(&self, other: &PeerSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("peer id `{0}` is already registered")]
    DuplicatePeerId(String),
    #[error("peer `{0}` disconnected before it could be announced")]
    AnnounceFailed(String, #[source] SendFailure),
}

/// Result of a successful join: the session's token and the ids it was told about.
#[derive(Debug)]
pub struct Registration {
    pub token: SessionToken,
    pub peers: Vec<String>,
}

struct PeerEntry {
    token: SessionToken,
    sender: PeerSender,
}

struct RegistryInner {
    peers: Mutex<HashMap<String, PeerEntry>>,
    next_token: AtomicU64,
}

/// Live mapping from peer id to that peer's outbound channel.
///
/// Every read and write goes through one mutex, so a snapshot taken during
/// join can never interleave with another peer's register or unregister.
/// The lock is never held across an await point.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    fn issue_token(&self) -> SessionToken {
        SessionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(
        &self,
        peer_id: &str,
        sender: PeerSender,
    ) -> Result<SessionToken, RegistryError> {
        let mut peers = self.inner.peers.lock();
        if peers.contains_key(peer_id) {
            return Err(RegistryError::DuplicatePeerId(peer_id.to_owned()));
        }
        let token = self.issue_token();
        peers.insert(peer_id.to_owned(), PeerEntry { token, sender });
        Ok(token)
    }

    /// Snapshots the current membership, queues the frame built by `announce`
    /// on the newcomer's own channel, then registers it. All three steps run
    /// under the registry lock, so the newcomer never sees itself and nobody
    /// can route to it before its announcement is queued.
    ///
    /// When `notify` is set it is queued for every peer in the snapshot in the
    /// same critical section, so a peer that learns about the newcomer from
    /// its own snapshot never also receives `notify` for it.
    pub fn join<F>(
        &self,
        peer_id: &str,
        sender: PeerSender,
        announce: F,
        notify: Option<&Message>,
    ) -> Result<Registration, RegistryError>
    where
        F: FnOnce(&[String]) -> Message,
    {
        let mut peers = self.inner.peers.lock();
        if peers.contains_key(peer_id) {
            return Err(RegistryError::DuplicatePeerId(peer_id.to_owned()));
        }

        let snapshot: Vec<String> = peers.keys().cloned().collect();
        sender
            .try_send(announce(&snapshot))
            .map_err(|err| RegistryError::AnnounceFailed(peer_id.to_owned(), err))?;

        if let Some(frame) = notify {
            fan_out(peers.values(), frame);
        }

        let token = self.issue_token();
        peers.insert(peer_id.to_owned(), PeerEntry { token, sender });
        Ok(Registration {
            token,
            peers: snapshot,
        })
    }

    /// Removes `peer_id` only while it still belongs to the session holding `token`.
    pub fn unregister(&self, peer_id: &str, token: SessionToken) -> bool {
        self.leave(peer_id, token, None)
    }

    /// `unregister`, queueing `notify` for the remaining peers under the same
    /// lock when an entry was actually removed. A peer joining afterwards
    /// never sees `notify` for someone absent from its own snapshot.
    pub fn leave(&self, peer_id: &str, token: SessionToken, notify: Option<&Message>) -> bool {
        let mut peers = self.inner.peers.lock();
        match peers.get(peer_id) {
            Some(entry) if entry.token == token => {
                peers.remove(peer_id);
                if let Some(frame) = notify {
                    fan_out(peers.values(), frame);
                }
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, peer_id: &str) -> Option<PeerSender> {
        self.inner
            .peers
            .lock()
            .get(peer_id)
            .map(|entry| entry.sender.clone())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.peers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort fan-out to every peer except `peer_id`. Returns how many
    /// queues accepted the frame.
    pub fn broadcast_except(&self, peer_id: &str, frame: &Message) -> usize {
        let peers = self.inner.peers.lock();
        fan_out(
            peers
                .iter()
                .filter(|(id, _)| id.as_str() != peer_id)
                .map(|(_, entry)| entry),
            frame,
        )
    }

    /// True when `peer_id` is registered and backed by `sender`'s channel.
    #[cfg(test)]
    pub fn is_bound_to(&self, peer_id: &str, sender: &PeerSender) -> bool {
        self.inner
            .peers
            .lock()
            .get(peer_id)
            .is_some_and(|entry| entry.sender.same_channel(sender))
    }
}

// Queue pushes never block, so this is safe to call with the registry locked.
fn fan_out<'a>(entries: impl Iterator<Item = &'a PeerEntry>, frame: &Message) -> usize {
    entries
        .filter(|entry| entry.sender.try_send(frame.clone()).is_ok())
        .count()
}
