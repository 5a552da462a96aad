// Session module: per-session state machine and its coordinator
//
// Negotiating -> Active -> Ended, with Negotiating -> Failed on timeout,
// media failure or departure. Ended and Failed are terminal.

mod actor;
mod coordinator;

pub use actor::SessionHandle;
pub use coordinator::SessionCoordinator;

use crate::{PeerId, SessionId, StreamHandle};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Negotiating,
    Active,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "Negotiating"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Ended => write!(f, "Ended"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why a session reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    HungUp,
    PeerLeft,
    NegotiationTimeout,
    MediaAcquisitionFailure,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::HungUp => write!(f, "HungUp"),
            EndReason::PeerLeft => write!(f, "PeerLeft"),
            EndReason::NegotiationTimeout => write!(f, "NegotiationTimeout"),
            EndReason::MediaAcquisitionFailure => write!(f, "MediaAcquisitionFailure"),
            EndReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Snapshot of a session as published by its actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Initiator: places the call
    pub peer_a: PeerId,
    /// Responder: answers the call
    pub peer_b: PeerId,
    pub state: SessionState,
    /// Unix millis
    pub created_at: u64,
    pub ended_at: Option<u64>,
    pub end_reason: Option<EndReason>,
    /// Peer whose hang-up, departure or media failure ended the session
    pub ended_by: Option<PeerId>,
    /// Peers that reported their media path ready
    pub ready: Vec<PeerId>,
}

impl Session {
    pub fn involves(&self, peer_id: &str) -> bool {
        self.peer_a == peer_id || self.peer_b == peer_id
    }

    pub fn counterpart(&self, peer_id: &str) -> Option<&PeerId> {
        if self.peer_a == peer_id {
            Some(&self.peer_b)
        } else if self.peer_b == peer_id {
            Some(&self.peer_a)
        } else {
            None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Notification addressed to one peer of a session.
///
/// Rendering layers consume `Active` and `Ended`; `Ended` is sent to both
/// peers for Ended and Failed outcomes alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Matched {
        session_id: SessionId,
        peer_id: PeerId,
        remote_peer: PeerId,
        initiator: bool,
    },
    Active {
        session_id: SessionId,
        peer_id: PeerId,
        remote_stream: Option<StreamHandle>,
    },
    Ended {
        session_id: SessionId,
        peer_id: PeerId,
        state: SessionState,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            SessionEvent::Matched { peer_id, .. }
            | SessionEvent::Active { peer_id, .. }
            | SessionEvent::Ended { peer_id, .. } => peer_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Matched { session_id, .. }
            | SessionEvent::Active { session_id, .. }
            | SessionEvent::Ended { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Negotiating.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(SessionState::Ended.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SessionEvent::Ended {
            session_id: "s1".to_string(),
            peer_id: "p1".to_string(),
            state: SessionState::Failed,
            reason: EndReason::NegotiationTimeout,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ended");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "negotiation_timeout");
        assert_eq!(event.peer_id(), "p1");
    }
}
