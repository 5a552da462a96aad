//! Registry: who is present and whether they can be matched
//!
//! All peer-table mutation goes through the single write lock held here.
//! Departures of peers that hold a session are reported over an `mpsc`
//! channel so the session coordinator can end that session.

use crate::{now_ms, PeerId, RendezvousError, Result, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Availability of a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Available,
    Matched,
    Gone,
}

/// A present peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub status: PeerStatus,
    /// Unix millis of registration
    pub registered_at: u64,
    /// Unix millis of the last heartbeat or relay activity
    pub last_seen: u64,
    /// Session held while `Matched`
    pub session_id: Option<SessionId>,
    /// Arrival order among available peers (lower waited longer)
    #[serde(skip)]
    available_seq: u64,
}

/// A peer that left while holding a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub session_id: SessionId,
}

/// Which side of a pair could not be claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClaimConflict {
    pub first_unavailable: bool,
    pub second_unavailable: bool,
}

struct RegistryTable {
    peers: HashMap<PeerId, Peer>,
    next_available_seq: u64,
}

impl RegistryTable {
    fn bump_seq(&mut self) -> u64 {
        self.next_available_seq += 1;
        self.next_available_seq
    }

    fn is_available(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.status == PeerStatus::Available)
            .unwrap_or(false)
    }
}

pub struct Registry {
    table: RwLock<RegistryTable>,
    departures: Option<mpsc::UnboundedSender<Departure>>,
}

impl Registry {
    /// Registry without departure notification (useful for tests)
    pub fn new() -> Self {
        Self {
            table: RwLock::new(RegistryTable {
                peers: HashMap::new(),
                next_available_seq: 0,
            }),
            departures: None,
        }
    }

    /// Registry that reports departures of matched peers on `departures`
    pub fn with_departures(departures: mpsc::UnboundedSender<Departure>) -> Self {
        Self {
            departures: Some(departures),
            ..Self::new()
        }
    }

    /// Register a peer as Available. A fresh UUID is used when no id is given.
    pub fn register(&self, peer_id: Option<PeerId>) -> Result<Peer> {
        let id = peer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = now_ms();

        let mut table = self.table.write();
        if table.peers.contains_key(&id) {
            return Err(RendezvousError::AlreadyRegistered(id));
        }

        let available_seq = table.bump_seq();
        let peer = Peer {
            id: id.clone(),
            status: PeerStatus::Available,
            registered_at: now,
            last_seen: now,
            session_id: None,
            available_seq,
        };
        table.peers.insert(id.clone(), peer.clone());
        drop(table);

        info!(peer_id = %id, "Peer registered");
        Ok(peer)
    }

    /// Remove a peer. Returns its final snapshot with status `Gone`.
    ///
    /// If the peer held a non-terminal session a `Departure` is emitted.
    pub fn deregister(&self, peer_id: &str) -> Result<Peer> {
        let mut peer = self
            .table
            .write()
            .peers
            .remove(peer_id)
            .ok_or_else(|| RendezvousError::UnknownPeer(peer_id.to_string()))?;

        let held = match (peer.status, peer.session_id.clone()) {
            (PeerStatus::Matched, Some(session_id)) => Some(session_id),
            _ => None,
        };
        peer.status = PeerStatus::Gone;

        info!(peer_id = %peer_id, session = ?held, "Peer deregistered");

        if let (Some(session_id), Some(tx)) = (held, &self.departures) {
            // Receiver gone means the coordinator is shutting down
            let _ = tx.send(Departure {
                peer_id: peer_id.to_string(),
                session_id,
            });
        }

        Ok(peer)
    }

    /// Refresh liveness
    pub fn heartbeat(&self, peer_id: &str) -> Result<()> {
        let mut table = self.table.write();
        let peer = table
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RendezvousError::UnknownPeer(peer_id.to_string()))?;
        peer.last_seen = now_ms();
        Ok(())
    }

    pub(crate) fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.table.write().peers.get_mut(peer_id) {
            peer.last_seen = now_ms();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.table.read().peers.get(peer_id).cloned()
    }

    /// Available peers, longest-waiting first
    pub fn list_available(&self) -> Vec<Peer> {
        let mut available: Vec<Peer> = self
            .table
            .read()
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Available)
            .cloned()
            .collect();
        available.sort_by_key(|p| p.available_seq);
        available
    }

    pub fn len(&self) -> usize {
        self.table.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of peers whose last activity is older than `cutoff_ms`
    pub fn stale_peers(&self, cutoff_ms: u64) -> Vec<PeerId> {
        self.table
            .read()
            .peers
            .values()
            .filter(|p| p.last_seen < cutoff_ms)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn is_in_session(&self, peer_id: &str, session_id: &str) -> bool {
        self.table
            .read()
            .peers
            .get(peer_id)
            .map(|p| p.status == PeerStatus::Matched && p.session_id.as_deref() == Some(session_id))
            .unwrap_or(false)
    }

    /// Move both peers from Available to Matched in one step, or neither.
    pub(crate) fn claim_pair(
        &self,
        first: &str,
        second: &str,
        session_id: &str,
    ) -> std::result::Result<(), ClaimConflict> {
        let mut table = self.table.write();
        let conflict = ClaimConflict {
            first_unavailable: !table.is_available(first),
            second_unavailable: first == second || !table.is_available(second),
        };
        if conflict.first_unavailable || conflict.second_unavailable {
            return Err(conflict);
        }

        for id in [first, second] {
            if let Some(peer) = table.peers.get_mut(id) {
                peer.status = PeerStatus::Matched;
                peer.session_id = Some(session_id.to_string());
            }
        }
        debug!(session_id = %session_id, first = %first, second = %second, "Claimed pair");
        Ok(())
    }

    /// Return a peer from a finished session to Available.
    ///
    /// Returns `None` if the peer already left or belongs to another session.
    pub(crate) fn release(&self, peer_id: &str, session_id: &str) -> Option<Peer> {
        let mut table = self.table.write();
        let seq = table.bump_seq();
        let peer = table.peers.get_mut(peer_id)?;
        if peer.status != PeerStatus::Matched || peer.session_id.as_deref() != Some(session_id) {
            return None;
        }
        peer.status = PeerStatus::Available;
        peer.session_id = None;
        peer.available_seq = seq;
        Some(peer.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_duplicate() {
        let registry = Registry::new();
        let peer = registry.register(Some("alice".to_string())).unwrap();
        assert_eq!(peer.status, PeerStatus::Available);
        assert_eq!(peer.id, "alice");

        let err = registry.register(Some("alice".to_string())).unwrap_err();
        assert_eq!(err, RendezvousError::AlreadyRegistered("alice".to_string()));
    }

    #[test]
    fn test_register_generates_id() {
        let registry = Registry::new();
        let a = registry.register(None).unwrap();
        let b = registry.register(None).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_deregister_marks_gone_and_allows_reregister() {
        let registry = Registry::new();
        registry.register(Some("bob".to_string())).unwrap();

        let gone = registry.deregister("bob").unwrap();
        assert_eq!(gone.status, PeerStatus::Gone);
        assert!(registry.get("bob").is_none());
        assert!(registry.register(Some("bob".to_string())).is_ok());
    }

    #[test]
    fn test_deregister_unknown() {
        let registry = Registry::new();
        assert!(matches!(
            registry.deregister("nobody"),
            Err(RendezvousError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_departure_reported_only_for_matched_peer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Registry::with_departures(tx);
        registry.register(Some("a".to_string())).unwrap();
        registry.register(Some("b".to_string())).unwrap();
        registry.register(Some("c".to_string())).unwrap();
        registry.claim_pair("a", "b", "s1").unwrap();

        registry.deregister("c").unwrap();
        assert!(rx.try_recv().is_err());

        registry.deregister("a").unwrap();
        let departure = rx.try_recv().unwrap();
        assert_eq!(departure.peer_id, "a");
        assert_eq!(departure.session_id, "s1");
    }

    #[test]
    fn test_claim_pair_is_all_or_nothing() {
        let registry = Registry::new();
        registry.register(Some("a".to_string())).unwrap();
        registry.register(Some("b".to_string())).unwrap();

        let conflict = registry.claim_pair("a", "ghost", "s1").unwrap_err();
        assert!(!conflict.first_unavailable);
        assert!(conflict.second_unavailable);
        assert_eq!(registry.get("a").unwrap().status, PeerStatus::Available);

        assert!(registry.claim_pair("a", "a", "s1").is_err());

        registry.claim_pair("a", "b", "s1").unwrap();
        assert!(registry.is_in_session("a", "s1"));
        assert!(registry.is_in_session("b", "s1"));
        assert!(registry.claim_pair("a", "b", "s2").is_err());
    }

    #[test]
    fn test_release_moves_to_back_of_available_order() {
        let registry = Registry::new();
        for id in ["a", "b", "c"] {
            registry.register(Some(id.to_string())).unwrap();
        }
        registry.claim_pair("a", "b", "s1").unwrap();

        assert!(registry.release("a", "other").is_none());
        let released = registry.release("a", "s1").unwrap();
        assert_eq!(released.status, PeerStatus::Available);
        assert!(released.session_id.is_none());

        let order: Vec<_> = registry.list_available().into_iter().map(|p| p.id).collect();
        assert_eq!(order, vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_stale_peers_and_heartbeat() {
        let registry = Registry::new();
        registry.register(Some("idle".to_string())).unwrap();
        let cutoff = now_ms() + 1_000;
        assert_eq!(registry.stale_peers(cutoff), vec!["idle".to_string()]);
        assert!(registry.stale_peers(0).is_empty());
        assert!(registry.heartbeat("idle").is_ok());
        assert!(registry.heartbeat("missing").is_err());
    }
}
