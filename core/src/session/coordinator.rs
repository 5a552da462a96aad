//! Session coordinator: owns every session actor
//!
//! Turns matched pairs into running sessions, routes peer commands to the
//! right actor and reacts to registry departures. Finished sessions stay
//! queryable until `prune_terminal` disposes them.

use super::actor::{SessionContext, SessionHandle};
use super::{Session, SessionEvent, SessionState};
use crate::chat::ChatRelay;
use crate::config::RendezvousConfig;
use crate::matchmaker::{MatchedPair, Matchmaker};
use crate::registry::{Departure, Registry};
use crate::signal::SignalExchange;
use crate::{RendezvousError, Result, SessionId, StreamHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct SessionCoordinator {
    context: Arc<SessionContext>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionCoordinator {
    pub fn new(
        config: RendezvousConfig,
        registry: Arc<Registry>,
        matchmaker: Arc<Matchmaker>,
        signals: Arc<SignalExchange>,
        chat: Arc<ChatRelay>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            context: Arc::new(SessionContext {
                registry,
                matchmaker,
                signals,
                chat,
                events,
                config,
            }),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.context.events.subscribe()
    }

    /// Pair the two longest-waiting peers and start their session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn try_match(&self) -> Result<Session> {
        let pair = self.context.matchmaker.try_match()?;
        Ok(self.start_session(pair))
    }

    pub(crate) fn start_session(&self, pair: MatchedPair) -> Session {
        let context = &self.context;
        context
            .signals
            .open(&pair.session_id, &pair.initiator, &pair.responder);
        context
            .chat
            .open(&pair.session_id, &pair.initiator, &pair.responder);

        let handle = SessionHandle::spawn(pair.clone(), context.clone());
        let session = handle.snapshot();
        self.sessions
            .write()
            .insert(pair.session_id.clone(), handle.clone());

        for (local, remote, initiator) in [
            (&pair.initiator, &pair.responder, true),
            (&pair.responder, &pair.initiator, false),
        ] {
            let _ = context.events.send(SessionEvent::Matched {
                session_id: pair.session_id.clone(),
                peer_id: local.clone(),
                remote_peer: remote.clone(),
                initiator,
            });
        }

        // A peer that deregistered between the claim and the insert above
        // produced a departure nobody could route yet
        for peer_id in [&pair.initiator, &pair.responder] {
            if !context.registry.is_in_session(peer_id, &pair.session_id) {
                let handle = handle.clone();
                let peer_id = peer_id.clone();
                tokio::spawn(async move { handle.peer_left(&peer_id).await });
            }
        }

        session
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RendezvousError::UnknownSession(session_id.to_string()))
    }

    pub fn session(&self, session_id: &str) -> Result<Session> {
        Ok(self.handle(session_id)?.snapshot())
    }

    /// Every session not yet disposed, live or finished
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().map(|h| h.snapshot()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|h| !h.is_terminal())
            .count()
    }

    pub async fn ready(
        &self,
        session_id: &str,
        peer_id: &str,
        stream: Option<StreamHandle>,
    ) -> Result<SessionState> {
        self.handle(session_id)?.ready(peer_id, stream).await
    }

    pub async fn media_failed(&self, session_id: &str, peer_id: &str) -> Result<SessionState> {
        self.handle(session_id)?.media_failed(peer_id).await
    }

    pub async fn hang_up(&self, session_id: &str, peer_id: &str) -> Result<Session> {
        self.handle(session_id)?.hang_up(peer_id).await
    }

    pub async fn wait_terminal(&self, session_id: &str) -> Result<Session> {
        Ok(self.handle(session_id)?.wait_terminal().await)
    }

    pub async fn peer_left(&self, departure: Departure) {
        match self.handle(&departure.session_id) {
            Ok(handle) => handle.peer_left(&departure.peer_id).await,
            Err(_) => debug!(
                session_id = %departure.session_id,
                peer_id = %departure.peer_id,
                "Departure for a session not yet started"
            ),
        }
    }

    /// Route registry departures to their sessions until the sender closes
    pub fn spawn_departure_pump(
        self: &Arc<Self>,
        mut departures: mpsc::UnboundedReceiver<Departure>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(departure) = departures.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.peer_left(departure).await;
            }
            debug!("Departure pump stopped");
        })
    }

    /// Dispose finished sessions whose end is older than `cutoff_ms`.
    /// Returns how many were removed.
    pub fn prune_terminal(&self, cutoff_ms: u64) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, handle)| {
                let session = handle.snapshot();
                session.is_terminal() && session.ended_at.map(|t| t < cutoff_ms).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write();
        for id in &expired {
            sessions.remove(id);
            self.context.signals.dispose(id);
            self.context.chat.dispose(id);
        }
        debug!(count = expired.len(), "Pruned finished sessions");
        expired.len()
    }

    /// End every live session and wait for each to settle
    pub async fn shutdown(&self) {
        let live: Vec<SessionHandle> = self
            .sessions
            .read()
            .values()
            .filter(|h| !h.is_terminal())
            .cloned()
            .collect();

        info!(live = live.len(), "Shutting down sessions");
        for handle in &live {
            handle.shutdown().await;
        }
        for handle in &live {
            handle.wait_terminal().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NoopMedia;
    use crate::{EndReason, PeerStatus};

    struct Fixture {
        registry: Arc<Registry>,
        matchmaker: Arc<Matchmaker>,
        coordinator: Arc<SessionCoordinator>,
    }

    fn fixture(peers: &[&str]) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::with_departures(tx));
        let matchmaker = Arc::new(Matchmaker::new(registry.clone()));
        let coordinator = Arc::new(SessionCoordinator::new(
            RendezvousConfig::default(),
            registry.clone(),
            matchmaker.clone(),
            Arc::new(SignalExchange::new(16, Arc::new(NoopMedia))),
            Arc::new(ChatRelay::new(256)),
        ));
        coordinator.spawn_departure_pump(rx);
        for id in peers {
            registry.register(Some(id.to_string())).unwrap();
            matchmaker.enqueue(id).unwrap();
        }
        Fixture {
            registry,
            matchmaker,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_try_match_starts_negotiating_session() {
        let f = fixture(&["p1", "p2"]);
        let mut events = f.coordinator.subscribe_events();

        let session = f.coordinator.try_match().unwrap();
        assert_eq!(session.state, SessionState::Negotiating);
        assert_eq!(session.peer_a, "p1");
        assert_eq!(session.peer_b, "p2");
        assert_eq!(f.registry.get("p1").unwrap().status, PeerStatus::Matched);

        match events.recv().await.unwrap() {
            SessionEvent::Matched {
                peer_id, initiator, ..
            } => {
                assert_eq!(peer_id, "p1");
                assert!(initiator);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.coordinator.live_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let f = fixture(&[]);
        assert_eq!(
            f.coordinator.session("missing"),
            Err(RendezvousError::UnknownSession("missing".to_string()))
        );
        assert!(matches!(
            f.coordinator.ready("missing", "p1", None).await,
            Err(RendezvousError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_departure_pump_ends_session() {
        let f = fixture(&["p1", "p2"]);
        let session = f.coordinator.try_match().unwrap();

        f.registry.deregister("p2").unwrap();
        let finished = f.coordinator.wait_terminal(&session.id).await.unwrap();
        assert_eq!(finished.state, SessionState::Failed);
        assert_eq!(finished.end_reason, Some(EndReason::PeerLeft));
        assert_eq!(finished.ended_by.as_deref(), Some("p2"));

        // Survivor is Available and queued again
        assert_eq!(f.registry.get("p1").unwrap().status, PeerStatus::Available);
        assert!(f.matchmaker.is_queued("p1"));
    }

    #[tokio::test]
    async fn test_departure_before_session_start_fails_session() {
        let f = fixture(&["p1", "p2"]);
        let pair = f.matchmaker.try_match().unwrap();

        // p2 leaves after the claim, before the session exists to route to
        f.registry.deregister("p2").unwrap();
        let session = f.coordinator.start_session(pair);
        assert_eq!(session.state, SessionState::Negotiating);

        let finished = f.coordinator.wait_terminal(&session.id).await.unwrap();
        assert_eq!(finished.state, SessionState::Failed);
        assert_eq!(finished.end_reason, Some(EndReason::PeerLeft));
        assert_eq!(finished.ended_by.as_deref(), Some("p2"));
        assert_eq!(f.registry.get("p1").unwrap().status, PeerStatus::Available);
        assert!(f.registry.get("p2").is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_live_and_recent_sessions() {
        let f = fixture(&["p1", "p2", "p3", "p4"]);
        let ended = f.coordinator.try_match().unwrap();
        let live = f.coordinator.try_match().unwrap();
        f.coordinator.hang_up(&ended.id, "p1").await.unwrap();

        assert_eq!(f.coordinator.prune_terminal(0), 0);
        assert_eq!(f.coordinator.prune_terminal(u64::MAX), 1);
        assert!(matches!(
            f.coordinator.session(&ended.id),
            Err(RendezvousError::UnknownSession(_))
        ));
        assert!(f.coordinator.session(&live.id).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_ends_live_sessions() {
        let f = fixture(&["p1", "p2"]);
        let session = f.coordinator.try_match().unwrap();
        f.coordinator.shutdown().await;

        let finished = f.coordinator.session(&session.id).unwrap();
        assert_eq!(finished.state, SessionState::Ended);
        assert_eq!(finished.end_reason, Some(EndReason::Shutdown));
        assert_eq!(f.coordinator.live_count(), 0);
    }
}
