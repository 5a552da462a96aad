//! Matchmaker: FIFO pairing of available peers
//!
//! The queue lock is held across the registry claim, so two concurrent
//! `try_match` calls can never hand out the same peer. Lock order is always
//! queue first, registry second.

use crate::registry::Registry;
use crate::{PeerId, RendezvousError, Result, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Two peers claimed for a new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPair {
    pub session_id: SessionId,
    /// Longest-waiting peer; places the call
    pub initiator: PeerId,
    /// Answers the call
    pub responder: PeerId,
}

impl MatchedPair {
    pub fn involves(&self, peer_id: &str) -> bool {
        self.initiator == peer_id || self.responder == peer_id
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    peer_id: PeerId,
    ticket: u64,
}

/// Arrival-ordered queue. An entry is live only while its ticket matches
/// the peer's current ticket, so re-queueing never duplicates a peer.
struct MatchQueue {
    entries: VecDeque<QueueEntry>,
    tickets: HashMap<PeerId, u64>,
    next_ticket: u64,
}

impl MatchQueue {
    fn pop_live(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.entries.pop_front() {
            if self.tickets.get(&entry.peer_id) == Some(&entry.ticket) {
                return Some(entry);
            }
        }
        None
    }
}

pub struct Matchmaker {
    registry: Arc<Registry>,
    queue: Mutex<MatchQueue>,
}

impl Matchmaker {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            queue: Mutex::new(MatchQueue {
                entries: VecDeque::new(),
                tickets: HashMap::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Append an Available peer to the tail of the queue.
    ///
    /// A peer that is already queued keeps its place.
    pub fn enqueue(&self, peer_id: &str) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.tickets.contains_key(peer_id) {
            return Ok(());
        }

        match self.registry.get(peer_id) {
            Some(peer) if peer.status == crate::PeerStatus::Available => {}
            Some(_) => return Err(RendezvousError::PeerBusy(peer_id.to_string())),
            None => return Err(RendezvousError::UnknownPeer(peer_id.to_string())),
        }

        queue.next_ticket += 1;
        let ticket = queue.next_ticket;
        queue.tickets.insert(peer_id.to_string(), ticket);
        queue.entries.push_back(QueueEntry {
            peer_id: peer_id.to_string(),
            ticket,
        });
        debug!(peer_id = %peer_id, ticket, "Peer queued");
        Ok(())
    }

    /// Remove a peer from the queue. Returns whether it was queued.
    pub fn withdraw(&self, peer_id: &str) -> bool {
        let removed = self.queue.lock().tickets.remove(peer_id).is_some();
        if removed {
            debug!(peer_id = %peer_id, "Peer withdrawn from queue");
        }
        removed
    }

    pub fn is_queued(&self, peer_id: &str) -> bool {
        self.queue.lock().tickets.contains_key(peer_id)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().tickets.len()
    }

    /// Pair the two longest-waiting available peers.
    pub fn try_match(&self) -> Result<MatchedPair> {
        let mut queue = self.queue.lock();

        loop {
            let first = queue.pop_live().ok_or(RendezvousError::NoPeerAvailable)?;
            let second = match queue.pop_live() {
                Some(entry) => entry,
                None => {
                    queue.entries.push_front(first);
                    return Err(RendezvousError::NoPeerAvailable);
                }
            };

            let session_id = Uuid::new_v4().to_string();
            match self
                .registry
                .claim_pair(&first.peer_id, &second.peer_id, &session_id)
            {
                Ok(()) => {
                    queue.tickets.remove(&first.peer_id);
                    queue.tickets.remove(&second.peer_id);
                    info!(
                        session_id = %session_id,
                        initiator = %first.peer_id,
                        responder = %second.peer_id,
                        "Matched peers"
                    );
                    return Ok(MatchedPair {
                        session_id,
                        initiator: first.peer_id,
                        responder: second.peer_id,
                    });
                }
                Err(conflict) => {
                    // Departed peers are dropped; the survivor keeps its place
                    if conflict.second_unavailable {
                        queue.tickets.remove(&second.peer_id);
                    } else {
                        queue.entries.push_front(second);
                    }
                    if conflict.first_unavailable {
                        queue.tickets.remove(&first.peer_id);
                    } else {
                        queue.entries.push_front(first);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerStatus;

    fn setup(ids: &[&str]) -> (Arc<Registry>, Matchmaker) {
        let registry = Arc::new(Registry::new());
        let matchmaker = Matchmaker::new(registry.clone());
        for id in ids {
            registry.register(Some(id.to_string())).unwrap();
            matchmaker.enqueue(id).unwrap();
        }
        (registry, matchmaker)
    }

    #[test]
    fn test_single_peer_cannot_match() {
        let (_registry, matchmaker) = setup(&["p1"]);
        assert_eq!(matchmaker.try_match(), Err(RendezvousError::NoPeerAvailable));
        assert!(matchmaker.is_queued("p1"));
    }

    #[test]
    fn test_pairs_in_arrival_order() {
        let (registry, matchmaker) = setup(&["p1", "p2", "p3", "p4", "p5"]);

        let first = matchmaker.try_match().unwrap();
        assert_eq!((first.initiator.as_str(), first.responder.as_str()), ("p1", "p2"));
        let second = matchmaker.try_match().unwrap();
        assert_eq!((second.initiator.as_str(), second.responder.as_str()), ("p3", "p4"));
        assert_eq!(matchmaker.try_match(), Err(RendezvousError::NoPeerAvailable));

        assert_eq!(registry.get("p1").unwrap().status, PeerStatus::Matched);
        assert_eq!(matchmaker.queued_len(), 1);
    }

    #[test]
    fn test_departed_peer_is_skipped() {
        let (registry, matchmaker) = setup(&["p1", "p2", "p3"]);
        registry.deregister("p1").unwrap();

        let pair = matchmaker.try_match().unwrap();
        assert_eq!(pair.initiator, "p2");
        assert_eq!(pair.responder, "p3");
    }

    #[test]
    fn test_departed_second_keeps_first_at_head() {
        let (registry, matchmaker) = setup(&["p1", "p2"]);
        registry.deregister("p2").unwrap();
        assert_eq!(matchmaker.try_match(), Err(RendezvousError::NoPeerAvailable));

        registry.register(Some("p3".to_string())).unwrap();
        matchmaker.enqueue("p3").unwrap();
        let pair = matchmaker.try_match().unwrap();
        assert_eq!(pair.initiator, "p1");
    }

    #[test]
    fn test_withdraw_and_requeue_goes_to_tail() {
        let (_registry, matchmaker) = setup(&["p1", "p2", "p3"]);
        assert!(matchmaker.withdraw("p1"));
        assert!(!matchmaker.withdraw("p1"));
        matchmaker.enqueue("p1").unwrap();
        matchmaker.enqueue("p1").unwrap();
        assert_eq!(matchmaker.queued_len(), 3);

        let pair = matchmaker.try_match().unwrap();
        assert_eq!((pair.initiator.as_str(), pair.responder.as_str()), ("p2", "p3"));
    }

    #[test]
    fn test_enqueue_rejects_unknown_and_matched() {
        let (_registry, matchmaker) = setup(&["p1", "p2"]);
        assert!(matches!(
            matchmaker.enqueue("ghost"),
            Err(RendezvousError::UnknownPeer(_))
        ));
        matchmaker.try_match().unwrap();
        assert_eq!(
            matchmaker.enqueue("p1"),
            Err(RendezvousError::PeerBusy("p1".to_string()))
        );
    }
}
