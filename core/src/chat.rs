//! Chat relay: ordered text side-channel of an active session
//!
//! One sequence counter per session, shared by both senders. Assignment,
//! history append and fan-out all happen under the room lock, so every
//! subscriber sees the same total order.

use crate::{now_ms, PeerId, RendezvousError, Result, SessionId};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session_id: SessionId,
    pub sender: PeerId,
    /// Monotonic per session, starting at 1
    pub sequence: u64,
    pub text: String,
    /// Unix millis
    pub sent_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomPhase {
    /// Session still negotiating
    Pending,
    Open,
    Closed,
}

struct RoomState {
    phase: RoomPhase,
    history: Vec<ChatMessage>,
    subscribers: Vec<mpsc::UnboundedSender<ChatMessage>>,
}

struct ChatRoom {
    peers: [PeerId; 2],
    state: Mutex<RoomState>,
}

impl ChatRoom {
    fn is_member(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p == peer_id)
    }
}

pub struct ChatRelay {
    rooms: RwLock<HashMap<SessionId, Arc<ChatRoom>>>,
    max_text_len: usize,
}

impl ChatRelay {
    pub fn new(max_text_len: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_text_len,
        }
    }

    pub(crate) fn open(&self, session_id: &str, first: &str, second: &str) {
        let room = ChatRoom {
            peers: [first.to_string(), second.to_string()],
            state: Mutex::new(RoomState {
                phase: RoomPhase::Pending,
                history: Vec::new(),
                subscribers: Vec::new(),
            }),
        };
        self.rooms.write().insert(session_id.to_string(), Arc::new(room));
    }

    /// Start accepting posts (session became Active)
    pub(crate) fn enable(&self, session_id: &str) {
        if let Some(room) = self.rooms.read().get(session_id) {
            let mut state = room.state.lock();
            if state.phase == RoomPhase::Pending {
                state.phase = RoomPhase::Open;
            }
        }
    }

    /// Stop accepting posts, end every subscription and drop the history
    pub(crate) fn close(&self, session_id: &str) {
        if let Some(room) = self.rooms.read().get(session_id) {
            let mut state = room.state.lock();
            state.phase = RoomPhase::Closed;
            state.subscribers.clear();
            state.history.clear();
        }
    }

    pub(crate) fn dispose(&self, session_id: &str) {
        self.rooms.write().remove(session_id);
    }

    fn room(&self, session_id: &str) -> Result<Arc<ChatRoom>> {
        self.rooms
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RendezvousError::UnknownSession(session_id.to_string()))
    }

    /// Assign the next sequence and fan the message out to both peers.
    pub fn post(&self, session_id: &str, sender: &str, text: &str) -> Result<ChatMessage> {
        let room = self.room(session_id)?;
        let mut state = room.state.lock();

        if state.phase != RoomPhase::Open {
            return Err(RendezvousError::SessionClosed);
        }
        if !room.is_member(sender) {
            return Err(RendezvousError::UnknownSender(sender.to_string()));
        }
        if text.trim().is_empty() {
            return Err(RendezvousError::EmptyMessage);
        }
        if text.len() > self.max_text_len {
            return Err(RendezvousError::MessageTooLong {
                limit: self.max_text_len,
            });
        }

        let message = ChatMessage {
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            sequence: state.history.len() as u64 + 1,
            text: text.to_string(),
            sent_at: now_ms(),
        };
        state.history.push(message.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());

        debug!(session_id = %session_id, sender = %sender, sequence = message.sequence, "Chat posted");
        Ok(message)
    }

    /// Every message posted so far, in sequence order. Chat does not
    /// outlive the session.
    pub fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let room = self.room(session_id)?;
        let state = room.state.lock();
        if state.phase == RoomPhase::Closed {
            return Err(RendezvousError::SessionClosed);
        }
        Ok(state.history.clone())
    }

    /// Push subscription for `peer_id`. Messages with a sequence above
    /// `after` are replayed first, then live posts follow in order.
    pub fn subscribe(&self, session_id: &str, peer_id: &str, after: u64) -> Result<ChatSubscription> {
        let room = self.room(session_id)?;
        if !room.is_member(peer_id) {
            return Err(RendezvousError::UnknownSender(peer_id.to_string()));
        }

        let mut state = room.state.lock();
        if state.phase == RoomPhase::Closed {
            return Err(RendezvousError::SessionClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for message in state.history.iter().filter(|m| m.sequence > after) {
            let _ = tx.send(message.clone());
        }
        state.subscribers.push(tx);

        Ok(ChatSubscription { rx })
    }
}

/// Live chat feed of one peer; ends when the session terminates.
pub struct ChatSubscription {
    rx: mpsc::UnboundedReceiver<ChatMessage>,
}

impl ChatSubscription {
    pub async fn next(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = ChatMessage> {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
    }
}
