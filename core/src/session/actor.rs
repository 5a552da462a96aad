// Session actor: one task per session owns its state machine
//
// Commands arrive over an mpsc channel and are answered on oneshot replies.
// Every transition is published on a watch channel so readers never have to
// round-trip through the task. The task exits once the session is terminal;
// the watch keeps the final snapshot.

use super::{EndReason, Session, SessionEvent, SessionState};
use crate::chat::ChatRelay;
use crate::config::RendezvousConfig;
use crate::matchmaker::{MatchedPair, Matchmaker};
use crate::registry::Registry;
use crate::signal::SignalExchange;
use crate::{now_ms, PeerId, RendezvousError, Result, StreamHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Collaborators every session actor talks to
pub(crate) struct SessionContext {
    pub registry: Arc<Registry>,
    pub matchmaker: Arc<Matchmaker>,
    pub signals: Arc<SignalExchange>,
    pub chat: Arc<ChatRelay>,
    pub events: broadcast::Sender<SessionEvent>,
    pub config: RendezvousConfig,
}

impl SessionContext {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Ready {
        peer_id: PeerId,
        stream: Option<StreamHandle>,
        reply: oneshot::Sender<Result<SessionState>>,
    },
    MediaFailed {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<SessionState>>,
    },
    HangUp {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<Session>>,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    Shutdown,
}

/// Cheap, cloneable handle to a running (or finished) session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<Session>,
}

impl SessionHandle {
    pub(crate) fn spawn(pair: MatchedPair, context: Arc<SessionContext>) -> Self {
        let session = Session {
            id: pair.session_id,
            peer_a: pair.initiator,
            peer_b: pair.responder,
            state: SessionState::Negotiating,
            created_at: now_ms(),
            ended_at: None,
            end_reason: None,
            ended_by: None,
            ready: Vec::new(),
        };

        let (command_tx, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.clone());

        let actor = SessionActor {
            session,
            streams: HashMap::new(),
            context,
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Latest published state
    pub fn snapshot(&self) -> Session {
        self.snapshot.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot.borrow().is_terminal()
    }

    fn check_member(&self, peer_id: &str) -> Result<()> {
        if self.snapshot.borrow().involves(peer_id) {
            Ok(())
        } else {
            Err(RendezvousError::UnknownSender(peer_id.to_string()))
        }
    }

    /// Error for a command the actor could not answer
    fn stopped(&self) -> RendezvousError {
        if self.is_terminal() {
            RendezvousError::SessionClosed
        } else {
            RendezvousError::CoordinatorStopped
        }
    }

    pub async fn ready(&self, peer_id: &str, stream: Option<StreamHandle>) -> Result<SessionState> {
        self.check_member(peer_id)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Ready {
                peer_id: peer_id.to_string(),
                stream,
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn media_failed(&self, peer_id: &str) -> Result<SessionState> {
        self.check_member(peer_id)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::MediaFailed {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// End the session. Hanging up a finished session returns its final
    /// snapshot unchanged.
    pub async fn hang_up(&self, peer_id: &str) -> Result<Session> {
        self.check_member(peer_id)?;
        if self.is_terminal() {
            return Ok(self.snapshot());
        }
        let (reply, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(SessionCommand::HangUp {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await;
        if sent.is_err() {
            return self.settled();
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => self.settled(),
        }
    }

    fn settled(&self) -> Result<Session> {
        if self.is_terminal() {
            Ok(self.snapshot())
        } else {
            Err(RendezvousError::CoordinatorStopped)
        }
    }

    pub(crate) async fn peer_left(&self, peer_id: &str) {
        let _ = self
            .commands
            .send(SessionCommand::PeerLeft {
                peer_id: peer_id.to_string(),
            })
            .await;
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }

    /// Resolve once the session is Ended or Failed
    pub async fn wait_terminal(&self) -> Session {
        let mut snapshot = self.snapshot.clone();
        let settled = match snapshot.wait_for(|session| session.is_terminal()).await {
            Ok(session) => session.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }
}

struct SessionActor {
    session: Session,
    /// Stream handle reported by each ready peer
    streams: HashMap<PeerId, Option<StreamHandle>>,
    context: Arc<SessionContext>,
    snapshot: watch::Sender<Session>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let deadline = tokio::time::sleep(self.context.config.negotiation_timeout());
        tokio::pin!(deadline);

        debug!(session_id = %self.session.id, "Session actor started");

        while !self.session.is_terminal() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => self.finish(SessionState::Ended, EndReason::Shutdown, None),
                },
                _ = &mut deadline, if self.session.state == SessionState::Negotiating => {
                    warn!(session_id = %self.session.id, "Negotiation timed out");
                    self.finish(SessionState::Failed, EndReason::NegotiationTimeout, None);
                }
            }
        }

        debug!(session_id = %self.session.id, "Session actor stopped");
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Ready {
                peer_id,
                stream,
                reply,
            } => {
                let _ = reply.send(self.on_ready(peer_id, stream));
            }
            SessionCommand::MediaFailed { peer_id, reply } => {
                let _ = reply.send(self.on_media_failed(peer_id));
            }
            SessionCommand::HangUp { peer_id, reply } => {
                let result = if self.session.involves(&peer_id) {
                    self.finish(SessionState::Ended, EndReason::HungUp, Some(peer_id));
                    Ok(self.session.clone())
                } else {
                    Err(RendezvousError::UnknownSender(peer_id))
                };
                let _ = reply.send(result);
            }
            SessionCommand::PeerLeft { peer_id } => {
                if !self.session.involves(&peer_id) {
                    return;
                }
                let state = match self.session.state {
                    SessionState::Negotiating => SessionState::Failed,
                    _ => SessionState::Ended,
                };
                self.finish(state, EndReason::PeerLeft, Some(peer_id));
            }
            SessionCommand::Shutdown => {
                self.finish(SessionState::Ended, EndReason::Shutdown, None);
            }
        }
    }

    fn on_ready(&mut self, peer_id: PeerId, stream: Option<StreamHandle>) -> Result<SessionState> {
        if !self.session.involves(&peer_id) {
            return Err(RendezvousError::UnknownSender(peer_id));
        }
        if self.session.is_terminal() {
            return Err(RendezvousError::SessionClosed);
        }

        if !self.session.ready.contains(&peer_id) {
            self.session.ready.push(peer_id.clone());
        }
        self.streams.insert(peer_id.clone(), stream);
        debug!(session_id = %self.session.id, peer_id = %peer_id, "Peer ready");

        if self.session.state == SessionState::Negotiating && self.session.ready.len() == 2 {
            self.activate();
        } else {
            self.publish();
        }
        Ok(self.session.state)
    }

    fn on_media_failed(&mut self, peer_id: PeerId) -> Result<SessionState> {
        if !self.session.involves(&peer_id) {
            return Err(RendezvousError::UnknownSender(peer_id));
        }
        let state = match self.session.state {
            SessionState::Negotiating => SessionState::Failed,
            SessionState::Active => SessionState::Ended,
            _ => return Err(RendezvousError::SessionClosed),
        };
        warn!(session_id = %self.session.id, peer_id = %peer_id, "Media acquisition failed");
        self.finish(state, EndReason::MediaAcquisitionFailure, Some(peer_id));
        Ok(self.session.state)
    }

    fn activate(&mut self) {
        self.session.state = SessionState::Active;
        self.context.chat.enable(&self.session.id);
        self.publish();

        info!(
            session_id = %self.session.id,
            peer_a = %self.session.peer_a,
            peer_b = %self.session.peer_b,
            "Session active"
        );

        for (local, remote) in [
            (&self.session.peer_a, &self.session.peer_b),
            (&self.session.peer_b, &self.session.peer_a),
        ] {
            self.context.emit(SessionEvent::Active {
                session_id: self.session.id.clone(),
                peer_id: local.clone(),
                remote_stream: self.streams.get(remote).cloned().flatten(),
            });
        }
    }

    /// Move to a terminal state and release everything the session held.
    fn finish(&mut self, state: SessionState, reason: EndReason, by: Option<PeerId>) {
        if self.session.is_terminal() {
            return;
        }
        let context = self.context.clone();
        let id = self.session.id.clone();

        self.session.state = state;
        self.session.end_reason = Some(reason);
        self.session.ended_by = by;
        self.session.ended_at = Some(now_ms());

        context.signals.close(&id);
        context.chat.close(&id);

        // Peers go back to Available before anyone can observe the terminal state
        for peer_id in [&self.session.peer_a, &self.session.peer_b] {
            if context.registry.release(peer_id, &id).is_some() && context.config.requeue_after_session {
                if let Err(e) = context.matchmaker.enqueue(peer_id) {
                    debug!(peer_id = %peer_id, error = %e, "Re-queue skipped");
                }
            }
        }

        self.publish();

        info!(
            session_id = %id,
            state = %state,
            reason = %reason,
            ended_by = ?self.session.ended_by,
            "Session finished"
        );

        for peer_id in [&self.session.peer_a, &self.session.peer_b] {
            context.emit(SessionEvent::Ended {
                session_id: id.clone(),
                peer_id: peer_id.clone(),
                state,
                reason,
            });
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.session.clone());
    }
}
