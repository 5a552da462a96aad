//! Signal exchange: ordered relay of negotiation payloads
//!
//! Each session gets one channel. Sequence numbers are assigned per sender
//! under the channel lock and messages are queued per recipient in that
//! order. A recipient's queue only shrinks when it acknowledges, so a
//! subscriber that reconnects resumes right after its last acknowledged
//! sequence (at-least-once; the sequence lets clients de-duplicate).

use crate::media::MediaHooks;
use crate::{PeerId, RendezvousError, Result, SessionId};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// A negotiation payload in flight between the two peers of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub session_id: SessionId,
    pub sender: PeerId,
    pub kind: SignalKind,
    /// Opaque to the exchange
    pub payload: Vec<u8>,
    /// Monotonic per sender within the session, starting at 1
    pub sequence: u64,
}

#[derive(Default)]
struct ChannelState {
    /// Last sequence assigned, per sender
    last_sequence: HashMap<PeerId, u64>,
    /// Unacknowledged messages, per recipient
    pending: HashMap<PeerId, VecDeque<SignalMessage>>,
    /// Last acknowledged sequence, per recipient
    acked: HashMap<PeerId, u64>,
    closed: bool,
}

struct SignalChannel {
    peers: [PeerId; 2],
    state: Mutex<ChannelState>,
    wake: watch::Sender<u64>,
}

impl SignalChannel {
    fn counterpart(&self, peer_id: &str) -> Option<&PeerId> {
        if self.peers[0] == peer_id {
            Some(&self.peers[1])
        } else if self.peers[1] == peer_id {
            Some(&self.peers[0])
        } else {
            None
        }
    }

    fn notify(&self) {
        self.wake.send_modify(|version| *version += 1);
    }
}

pub struct SignalExchange {
    channels: RwLock<HashMap<SessionId, Arc<SignalChannel>>>,
    max_pending: usize,
    media: Arc<dyn MediaHooks>,
}

impl SignalExchange {
    pub fn new(max_pending: usize, media: Arc<dyn MediaHooks>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            max_pending,
            media,
        }
    }

    pub(crate) fn open(&self, session_id: &str, first: &str, second: &str) {
        let (wake, _) = watch::channel(0);
        let channel = SignalChannel {
            peers: [first.to_string(), second.to_string()],
            state: Mutex::new(ChannelState::default()),
            wake,
        };
        self.channels
            .write()
            .insert(session_id.to_string(), Arc::new(channel));
    }

    /// Refuse further sends; live subscribers drain what is queued and end.
    pub(crate) fn close(&self, session_id: &str) {
        if let Some(channel) = self.channels.read().get(session_id).cloned() {
            channel.state.lock().closed = true;
            channel.notify();
        }
    }

    pub(crate) fn dispose(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }

    fn channel(&self, session_id: &str) -> Result<Arc<SignalChannel>> {
        self.channels
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RendezvousError::UnknownSession(session_id.to_string()))
    }

    /// Queue a payload for the sender's counterpart and return its sequence.
    pub fn send(
        &self,
        session_id: &str,
        sender: &str,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let channel = self.channel(session_id)?;

        let (message, recipient) = {
            let mut state = channel.state.lock();
            if state.closed {
                return Err(RendezvousError::SessionClosed);
            }
            let recipient = channel
                .counterpart(sender)
                .ok_or_else(|| RendezvousError::UnknownSender(sender.to_string()))?
                .clone();

            let backlog = state.pending.get(&recipient).map(|q| q.len()).unwrap_or(0);
            if backlog >= self.max_pending {
                warn!(session_id = %session_id, recipient = %recipient, backlog, "Signal backlog full");
                return Err(RendezvousError::SignalBacklogFull(recipient));
            }

            let sequence = state.last_sequence.entry(sender.to_string()).or_insert(0);
            *sequence += 1;
            let message = SignalMessage {
                session_id: session_id.to_string(),
                sender: sender.to_string(),
                kind,
                payload,
                sequence: *sequence,
            };
            state
                .pending
                .entry(recipient.clone())
                .or_default()
                .push_back(message.clone());
            (message, recipient)
        };
        channel.notify();

        debug!(
            session_id = %session_id,
            sender = %sender,
            kind = ?kind,
            sequence = message.sequence,
            "Signal queued"
        );

        match kind {
            SignalKind::Offer => self.media.place_call(&recipient, &message),
            SignalKind::Answer => self.media.answer_call(&recipient, &message),
            SignalKind::Candidate => self.media.add_candidate(&recipient, &message),
        }

        Ok(message.sequence)
    }

    /// Subscribe to the messages addressed to `peer_id`, starting after its
    /// last acknowledged sequence.
    pub fn receive(&self, session_id: &str, peer_id: &str) -> Result<SignalSubscription> {
        let channel = self.channel(session_id)?;
        let cursor = {
            let state = channel.state.lock();
            if state.closed {
                return Err(RendezvousError::SessionClosed);
            }
            if channel.counterpart(peer_id).is_none() {
                return Err(RendezvousError::UnknownSender(peer_id.to_string()));
            }
            state.acked.get(peer_id).copied().unwrap_or(0)
        };
        let wake = channel.wake.subscribe();

        Ok(SignalSubscription {
            channel,
            peer_id: peer_id.to_string(),
            cursor,
            wake,
        })
    }

    /// Acknowledge everything addressed to `peer_id` up to `sequence`.
    pub fn ack(&self, session_id: &str, peer_id: &str, sequence: u64) -> Result<()> {
        let channel = self.channel(session_id)?;
        let mut state = channel.state.lock();
        if state.closed {
            return Err(RendezvousError::SessionClosed);
        }
        let sender = channel
            .counterpart(peer_id)
            .ok_or_else(|| RendezvousError::UnknownSender(peer_id.to_string()))?;

        let highest = state.last_sequence.get(sender).copied().unwrap_or(0);
        if sequence > highest {
            return Err(RendezvousError::InvalidAck {
                acked: sequence,
                highest,
            });
        }

        let acked = state.acked.entry(peer_id.to_string()).or_insert(0);
        *acked = (*acked).max(sequence);
        let acked = *acked;
        if let Some(queue) = state.pending.get_mut(peer_id) {
            while queue.front().map(|m| m.sequence <= acked).unwrap_or(false) {
                queue.pop_front();
            }
        }
        Ok(())
    }

    /// Unacknowledged messages waiting for `peer_id`
    pub fn pending_count(&self, session_id: &str, peer_id: &str) -> Result<usize> {
        let channel = self.channel(session_id)?;
        let state = channel.state.lock();
        Ok(state.pending.get(peer_id).map(|q| q.len()).unwrap_or(0))
    }
}

/// One peer's view of its incoming signal queue.
///
/// Dropping the subscription cancels it without touching the queue or the
/// other peer's subscription.
pub struct SignalSubscription {
    channel: Arc<SignalChannel>,
    peer_id: PeerId,
    cursor: u64,
    wake: watch::Receiver<u64>,
}

impl SignalSubscription {
    /// Next message after the cursor; `None` once the session is closed and
    /// the queue is drained.
    pub async fn next(&mut self) -> Option<SignalMessage> {
        loop {
            self.wake.borrow_and_update();
            {
                let state = self.channel.state.lock();
                let next = state
                    .pending
                    .get(&self.peer_id)
                    .and_then(|q| q.iter().find(|m| m.sequence > self.cursor))
                    .cloned();
                if let Some(message) = next {
                    self.cursor = message.sequence;
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            if self.wake.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Sequence of the last message handed out
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn into_stream(self) -> impl Stream<Item = SignalMessage> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|message| (message, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MockMediaHooks, NoopMedia};
    use futures::StreamExt;
    use std::time::Duration;

    fn exchange() -> SignalExchange {
        let exchange = SignalExchange::new(8, Arc::new(NoopMedia));
        exchange.open("s1", "p1", "p2");
        exchange
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let exchange = exchange();
        assert_eq!(exchange.send("s1", "p1", SignalKind::Offer, b"O1".to_vec()).unwrap(), 1);
        assert_eq!(exchange.send("s1", "p1", SignalKind::Candidate, b"C1".to_vec()).unwrap(), 2);
        assert_eq!(exchange.send("s1", "p2", SignalKind::Answer, b"A1".to_vec()).unwrap(), 1);

        let mut p2 = exchange.receive("s1", "p2").unwrap();
        let first = p2.next().await.unwrap();
        assert_eq!(first.kind, SignalKind::Offer);
        assert_eq!(first.payload, b"O1".to_vec());
        assert_eq!(first.sequence, 1);
        assert_eq!(p2.next().await.unwrap().sequence, 2);

        let mut p1 = exchange.receive("s1", "p1").unwrap();
        let answer = p1.next().await.unwrap();
        assert_eq!(answer.sender, "p2");
        assert_eq!(answer.kind, SignalKind::Answer);
    }

    #[tokio::test]
    async fn test_receive_waits_for_new_data() {
        let exchange = Arc::new(exchange());
        let mut p2 = exchange.receive("s1", "p2").unwrap();

        let sender = exchange.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender
                .send("s1", "p1", SignalKind::Offer, b"late".to_vec())
                .unwrap();
        });

        let message = tokio::time::timeout(Duration::from_secs(1), p2.next())
            .await
            .expect("subscriber should wake")
            .unwrap();
        assert_eq!(message.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_resume_after_last_ack() {
        let exchange = exchange();
        for i in 0..3 {
            exchange
                .send("s1", "p1", SignalKind::Candidate, vec![i])
                .unwrap();
        }

        let mut first = exchange.receive("s1", "p2").unwrap();
        assert_eq!(first.next().await.unwrap().sequence, 1);
        assert_eq!(first.next().await.unwrap().sequence, 2);
        exchange.ack("s1", "p2", 1).unwrap();
        drop(first);

        // Reconnect: sequence 2 was delivered but never acknowledged
        let mut resumed = exchange.receive("s1", "p2").unwrap();
        assert_eq!(resumed.next().await.unwrap().sequence, 2);
        assert_eq!(resumed.next().await.unwrap().sequence, 3);
        assert_eq!(exchange.pending_count("s1", "p2").unwrap(), 2);
    }

    #[test]
    fn test_ack_beyond_assigned_is_rejected() {
        let exchange = exchange();
        exchange.send("s1", "p1", SignalKind::Offer, vec![]).unwrap();
        assert_eq!(
            exchange.ack("s1", "p2", 5),
            Err(RendezvousError::InvalidAck { acked: 5, highest: 1 })
        );
        assert_eq!(exchange.pending_count("s1", "p2").unwrap(), 1);
    }

    #[test]
    fn test_unknown_sender_and_closed_session() {
        let exchange = exchange();
        assert_eq!(
            exchange.send("s1", "mallory", SignalKind::Offer, vec![]),
            Err(RendezvousError::UnknownSender("mallory".to_string()))
        );
        assert!(matches!(
            exchange.send("nope", "p1", SignalKind::Offer, vec![]),
            Err(RendezvousError::UnknownSession(_))
        ));

        exchange.close("s1");
        assert_eq!(
            exchange.send("s1", "p1", SignalKind::Candidate, vec![]),
            Err(RendezvousError::SessionClosed)
        );
        assert!(matches!(
            exchange.receive("s1", "p2"),
            Err(RendezvousError::SessionClosed)
        ));
    }

    #[test]
    fn test_backlog_limit() {
        let exchange = exchange();
        for _ in 0..8 {
            exchange.send("s1", "p1", SignalKind::Candidate, vec![]).unwrap();
        }
        assert_eq!(
            exchange.send("s1", "p1", SignalKind::Candidate, vec![]),
            Err(RendezvousError::SignalBacklogFull("p2".to_string()))
        );
        // The other direction is unaffected
        assert!(exchange.send("s1", "p2", SignalKind::Answer, vec![]).is_ok());
    }

    #[tokio::test]
    async fn test_stream_drains_then_ends_on_close() {
        let exchange = exchange();
        let subscription = exchange.receive("s1", "p2").unwrap();
        exchange.send("s1", "p1", SignalKind::Offer, b"O".to_vec()).unwrap();
        exchange.send("s1", "p1", SignalKind::Candidate, b"C".to_vec()).unwrap();
        exchange.close("s1");

        let received: Vec<_> = subscription.into_stream().collect().await;
        let sequences: Vec<_> = received.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_payloads_forwarded_to_media_hooks() {
        let mut media = MockMediaHooks::new();
        media
            .expect_place_call()
            .withf(|recipient, offer| recipient == "p2" && offer.payload == b"sdp-offer".to_vec())
            .times(1)
            .return_const(());
        media
            .expect_answer_call()
            .withf(|recipient, _| recipient == "p1")
            .times(1)
            .return_const(());
        media.expect_add_candidate().times(2).return_const(());

        let exchange = SignalExchange::new(8, Arc::new(media));
        exchange.open("s1", "p1", "p2");
        exchange.send("s1", "p1", SignalKind::Offer, b"sdp-offer".to_vec()).unwrap();
        exchange.send("s1", "p2", SignalKind::Answer, b"sdp-answer".to_vec()).unwrap();
        exchange.send("s1", "p1", SignalKind::Candidate, vec![1]).unwrap();
        exchange.send("s1", "p2", SignalKind::Candidate, vec![2]).unwrap();
    }
}
