//! Rendezvous: the client command surface
//!
//! Composes the registry, matchmaker, session coordinator and both relays
//! behind one handle. Constructing a `Rendezvous` spawns its departure pump,
//! so it must happen inside a tokio runtime.

use crate::chat::{ChatMessage, ChatRelay, ChatSubscription};
use crate::config::RendezvousConfig;
use crate::directory::{Directory, DirectoryError, DirectoryRecord};
use crate::matchmaker::Matchmaker;
use crate::media::{MediaHooks, NoopMedia};
use crate::registry::{Peer, PeerStatus, Registry};
use crate::session::{Session, SessionCoordinator, SessionEvent, SessionState};
use crate::signal::{SignalExchange, SignalKind, SignalSubscription};
use crate::{now_ms, PeerId, RendezvousError, Result, SessionId, StreamHandle};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-in-time counters for status endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousStats {
    pub peers: usize,
    pub available: usize,
    pub queued: usize,
    pub live_sessions: usize,
    pub retained_sessions: usize,
}

/// Outcome of one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_peers: Vec<PeerId>,
    pub pruned_sessions: usize,
}

pub struct Rendezvous {
    config: RendezvousConfig,
    registry: Arc<Registry>,
    matchmaker: Arc<Matchmaker>,
    signals: Arc<SignalExchange>,
    chat: Arc<ChatRelay>,
    coordinator: Arc<SessionCoordinator>,
    directory: RwLock<Option<Arc<dyn Directory>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Rendezvous {
    pub fn new(config: RendezvousConfig) -> Self {
        Self::with_media(config, Arc::new(NoopMedia))
    }

    pub fn with_media(config: RendezvousConfig, media: Arc<dyn MediaHooks>) -> Self {
        let (departures_tx, departures_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::with_departures(departures_tx));
        let matchmaker = Arc::new(Matchmaker::new(registry.clone()));
        let signals = Arc::new(SignalExchange::new(config.max_pending_signals, media));
        let chat = Arc::new(ChatRelay::new(config.max_chat_text_len));
        let coordinator = Arc::new(SessionCoordinator::new(
            config.clone(),
            registry.clone(),
            matchmaker.clone(),
            signals.clone(),
            chat.clone(),
        ));
        let pump = coordinator.spawn_departure_pump(departures_rx);

        Self {
            config,
            registry,
            matchmaker,
            signals,
            chat,
            coordinator,
            directory: RwLock::new(None),
            tasks: Mutex::new(vec![pump]),
        }
    }

    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Register a peer and put it in the match queue. The registration is
    /// announced on the attached directory, if any.
    pub fn register(&self, peer_id: Option<PeerId>) -> Result<Peer> {
        let peer = self.registry.register(peer_id)?;
        self.matchmaker.enqueue(&peer.id)?;

        if let Some(directory) = self.directory.read().clone() {
            if let Err(e) = directory.append(&peer.id) {
                warn!(peer_id = %peer.id, error = %e, "Failed to announce peer");
            }
        }
        Ok(peer)
    }

    /// Remove a peer. Any session it held is ended with reason PeerLeft
    /// before this returns.
    pub async fn deregister(&self, peer_id: &str) -> Result<Peer> {
        self.matchmaker.withdraw(peer_id);
        let peer = self.registry.deregister(peer_id)?;

        if let Some(session_id) = &peer.session_id {
            if let Err(e) = self.coordinator.wait_terminal(session_id).await {
                debug!(peer_id = %peer_id, error = %e, "Departed before session start");
            }
        }
        Ok(peer)
    }

    pub fn heartbeat(&self, peer_id: &str) -> Result<()> {
        self.registry.heartbeat(peer_id)
    }

    pub fn peer(&self, peer_id: &str) -> Result<Peer> {
        self.registry
            .get(peer_id)
            .ok_or_else(|| RendezvousError::UnknownPeer(peer_id.to_string()))
    }

    pub fn list_available(&self) -> Vec<Peer> {
        self.registry.list_available()
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    pub fn try_match(&self) -> Result<Session> {
        self.coordinator.try_match()
    }

    /// Session a Matched peer currently holds, if it has started
    pub fn current_session(&self, peer_id: &str) -> Result<Option<Session>> {
        let peer = self.peer(peer_id)?;
        match (peer.status, peer.session_id) {
            (PeerStatus::Matched, Some(session_id)) => Ok(self.coordinator.session(&session_id).ok()),
            _ => Ok(None),
        }
    }

    /// Wait until `peer_id` is paired, up to the queue wait timeout.
    ///
    /// On expiry the peer leaves the queue but stays registered, and the
    /// call returns `NoPeerAvailable`.
    pub async fn join_queue(&self, peer_id: &str) -> Result<Session> {
        let mut events = self.coordinator.subscribe_events();

        let peer = self.peer(peer_id)?;
        if peer.status == PeerStatus::Matched {
            if let Some(session) = self.current_session(peer_id)? {
                return Ok(session);
            }
        } else {
            self.matchmaker.enqueue(peer_id)?;
            loop {
                match self.coordinator.try_match() {
                    Ok(session) if session.involves(peer_id) => return Ok(session),
                    Ok(_) => continue,
                    Err(RendezvousError::NoPeerAvailable) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(peer_id = %peer_id, "Waiting in queue");
        let waited = tokio::time::timeout(
            self.config.queue_wait_timeout(),
            self.await_matched(peer_id, &mut events),
        )
        .await;
        if let Ok(Some(session_id)) = waited {
            return self.coordinator.session(&session_id);
        }

        self.matchmaker.withdraw(peer_id);
        // A match may have landed between the timeout and the withdraw
        if let Some(session) = self.current_session(peer_id)? {
            return Ok(session);
        }
        if self.peer(peer_id)?.status == PeerStatus::Matched {
            // Claimed, but the session is still being started
            if let Some(session_id) = self.await_matched(peer_id, &mut events).await {
                return self.coordinator.session(&session_id);
            }
        }
        info!(peer_id = %peer_id, "Queue wait expired");
        Err(RendezvousError::NoPeerAvailable)
    }

    /// Next session `peer_id` is matched into, as seen on the event stream
    async fn await_matched(
        &self,
        peer_id: &str,
        events: &mut broadcast::Receiver<SessionEvent>,
    ) -> Option<SessionId> {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Matched {
                    session_id,
                    peer_id: matched_peer,
                    ..
                }) if matched_peer == peer_id => return Some(session_id),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Ok(Some(session)) = self.current_session(peer_id) {
                        return Some(session.id);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    pub fn send_signal(
        &self,
        session_id: &str,
        sender: &str,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let sequence = self.signals.send(session_id, sender, kind, payload)?;
        self.registry.touch(sender);
        Ok(sequence)
    }

    pub fn receive_signals(&self, session_id: &str, peer_id: &str) -> Result<SignalSubscription> {
        let subscription = self.signals.receive(session_id, peer_id)?;
        self.registry.touch(peer_id);
        Ok(subscription)
    }

    pub fn ack_signals(&self, session_id: &str, peer_id: &str, sequence: u64) -> Result<()> {
        self.signals.ack(session_id, peer_id, sequence)?;
        self.registry.touch(peer_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    pub async fn mark_ready(
        &self,
        session_id: &str,
        peer_id: &str,
        stream: Option<StreamHandle>,
    ) -> Result<SessionState> {
        let state = self.coordinator.ready(session_id, peer_id, stream).await?;
        self.registry.touch(peer_id);
        Ok(state)
    }

    pub async fn report_media_failure(&self, session_id: &str, peer_id: &str) -> Result<SessionState> {
        self.coordinator.media_failed(session_id, peer_id).await
    }

    pub async fn hang_up(&self, session_id: &str, peer_id: &str) -> Result<Session> {
        self.coordinator.hang_up(session_id, peer_id).await
    }

    pub fn session(&self, session_id: &str) -> Result<Session> {
        self.coordinator.session(session_id)
    }

    /// Live sessions and finished ones still within retention
    pub fn sessions(&self) -> Vec<Session> {
        self.coordinator.sessions()
    }

    pub async fn wait_terminal(&self, session_id: &str) -> Result<Session> {
        self.coordinator.wait_terminal(session_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe_events()
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    pub fn send_chat(&self, session_id: &str, sender: &str, text: &str) -> Result<ChatMessage> {
        let message = self.chat.post(session_id, sender, text)?;
        self.registry.touch(sender);
        Ok(message)
    }

    pub fn chat_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.chat.history(session_id)
    }

    pub fn subscribe_chat(&self, session_id: &str, peer_id: &str, after: u64) -> Result<ChatSubscription> {
        self.chat.subscribe(session_id, peer_id, after)
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    pub fn stats(&self) -> RendezvousStats {
        let sessions = self.coordinator.sessions();
        let live_sessions = sessions.iter().filter(|s| !s.is_terminal()).count();
        RendezvousStats {
            peers: self.registry.len(),
            available: self.registry.list_available().len(),
            queued: self.matchmaker.queued_len(),
            live_sessions,
            retained_sessions: sessions.len() - live_sessions,
        }
    }

    /// Deregister silent peers, then dispose finished sessions past retention.
    pub async fn sweep(&self) -> SweepReport {
        let now = now_ms();
        let liveness_cutoff = now.saturating_sub(self.config.peer_liveness_timeout_ms);
        let stale_peers = self.registry.stale_peers(liveness_cutoff);

        for peer_id in &stale_peers {
            warn!(peer_id = %peer_id, "Peer missed liveness window");
            if let Err(e) = self.deregister(peer_id).await {
                debug!(peer_id = %peer_id, error = %e, "Stale peer already gone");
            }
        }

        let retention_cutoff = now.saturating_sub(self.config.session_retention_ms);
        let pruned_sessions = self.coordinator.prune_terminal(retention_cutoff);

        SweepReport {
            stale_peers,
            pruned_sessions,
        }
    }

    /// Run `sweep` every `sweep_interval` until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        let task = tokio::spawn(async move {
            loop {
                interval.tick().await;
                let Some(rendezvous) = this.upgrade() else {
                    break;
                };
                let report = rendezvous.sweep().await;
                if !report.stale_peers.is_empty() || report.pruned_sessions > 0 {
                    info!(
                        stale = report.stale_peers.len(),
                        pruned = report.pruned_sessions,
                        "Maintenance sweep"
                    );
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Announce local registrations on `directory` and register peers that
    /// other origins announce. Returns how many existing records were
    /// ingested.
    pub fn attach_directory(
        self: &Arc<Self>,
        directory: Arc<dyn Directory>,
    ) -> std::result::Result<usize, DirectoryError> {
        let mut changes = directory.watch();
        let mut ingested = 0;
        for record in directory.records()? {
            if self.ingest(directory.origin(), &record) {
                ingested += 1;
            }
        }
        info!(origin = %directory.origin(), ingested, "Directory attached");

        let origin = directory.origin().to_string();
        *self.directory.write() = Some(directory);

        let this: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(record) = changes.recv().await {
                let Some(rendezvous) = this.upgrade() else {
                    break;
                };
                rendezvous.ingest(&origin, &record);
            }
        });
        self.tasks.lock().push(task);
        Ok(ingested)
    }

    fn ingest(&self, local_origin: &str, record: &DirectoryRecord) -> bool {
        if record.origin == local_origin {
            return false;
        }
        match self.registry.register(Some(record.peer_id.clone())) {
            Ok(peer) => {
                if let Err(e) = self.matchmaker.enqueue(&peer.id) {
                    debug!(peer_id = %peer.id, error = %e, "Announced peer not queued");
                }
                debug!(peer_id = %peer.id, origin = %record.origin, "Peer discovered");
                true
            }
            Err(RendezvousError::AlreadyRegistered(_)) => false,
            Err(e) => {
                warn!(peer_id = %record.peer_id, error = %e, "Could not register announced peer");
                false
            }
        }
    }

    /// Stop background tasks and end every live session with reason Shutdown
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.coordinator.shutdown().await;
        info!("Rendezvous stopped");
    }
}
