// Callmatch Core: rendezvous and signaling coordinator
//
// Pairs anonymous peers into one-to-one call sessions, drives each session
// through negotiation, and relays signaling payloads and chat between the
// two endpoints for the lifetime of the session.

pub mod chat;
pub mod config;
pub mod directory;
pub mod matchmaker;
pub mod media;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod signal;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use chat::{ChatMessage, ChatRelay, ChatSubscription};
pub use config::RendezvousConfig;
pub use directory::{Directory, DirectoryError, DirectoryRecord, MemoryDirectory, SledDirectory};
pub use matchmaker::{MatchedPair, Matchmaker};
pub use media::{MediaHooks, NoopMedia};
pub use registry::{Departure, Peer, PeerStatus, Registry};
pub use rendezvous::{Rendezvous, RendezvousStats, SweepReport};
pub use session::{
    EndReason, Session, SessionCoordinator, SessionEvent, SessionHandle, SessionState,
};
pub use signal::{SignalExchange, SignalKind, SignalMessage, SignalSubscription};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaque peer identifier, supplied by the client or generated on registration.
pub type PeerId = String;

/// Session identifier (UUID v4).
pub type SessionId = String;

/// Opaque handle to a media stream, owned by the rendering layer.
pub type StreamHandle = String;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("Peer {0} is already registered")]
    AlreadyRegistered(PeerId),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Peer {0} is already in a session")]
    PeerBusy(PeerId),
    #[error("No peer available")]
    NoPeerAvailable,
    #[error("Negotiation timed out")]
    NegotiationTimeout,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
    #[error("Peer {0} is not a member of this session")]
    UnknownSender(PeerId),
    #[error("Media acquisition failed")]
    MediaAcquisitionFailure,
    #[error("Peer left the session")]
    PeerLeft,
    #[error("Acknowledged sequence {acked} was never assigned (highest is {highest})")]
    InvalidAck { acked: u64, highest: u64 },
    #[error("Signal backlog full for peer {0}")]
    SignalBacklogFull(PeerId),
    #[error("Chat message exceeds {limit} bytes")]
    MessageTooLong { limit: usize },
    #[error("Chat message is empty")]
    EmptyMessage,
    #[error("Coordinator stopped")]
    CoordinatorStopped,
}

impl RendezvousError {
    /// Whether the caller can carry on by retrying, re-queueing or
    /// discarding local session state. Everything else is a contract
    /// violation that fails only the request that caused it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RendezvousError::NoPeerAvailable
                | RendezvousError::SessionClosed
                | RendezvousError::NegotiationTimeout
                | RendezvousError::MediaAcquisitionFailure
                | RendezvousError::PeerLeft
                | RendezvousError::SignalBacklogFull(_)
                | RendezvousError::MessageTooLong { .. }
                | RendezvousError::EmptyMessage
        )
    }
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RendezvousError::NoPeerAvailable.is_recoverable());
        assert!(RendezvousError::SessionClosed.is_recoverable());
        assert!(!RendezvousError::UnknownSender("p".into()).is_recoverable());
        assert!(!RendezvousError::InvalidAck { acked: 9, highest: 1 }.is_recoverable());
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
