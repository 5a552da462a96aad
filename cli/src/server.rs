use callmatch_core::{
    ChatMessage, EndReason, Rendezvous, RendezvousError, SessionEvent, SessionId, SessionState,
    SignalKind, SignalMessage,
};
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use warp::Filter;

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

/// Commands a connected peer sends over its WebSocket
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinQueue,
    Signal {
        session_id: String,
        kind: SignalKind,
        payload: String,
    },
    Ack {
        session_id: String,
        sequence: u64,
    },
    Ready {
        session_id: String,
        #[serde(default)]
        stream: Option<String>,
    },
    MediaFailed {
        session_id: String,
    },
    HangUp {
        session_id: String,
    },
    Chat {
        session_id: String,
        text: String,
    },
    History {
        session_id: String,
    },
    Heartbeat,
}

/// Events pushed to a connected peer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered {
        peer_id: String,
    },
    Matched {
        session_id: String,
        remote_peer: String,
        initiator: bool,
    },
    NoPeerAvailable,
    Signal {
        session_id: String,
        sender: String,
        kind: SignalKind,
        payload: String,
        sequence: u64,
    },
    SessionActive {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_stream: Option<String>,
    },
    Chat {
        session_id: String,
        sender: String,
        sequence: u64,
        text: String,
        sent_at: u64,
    },
    History {
        session_id: String,
        messages: Vec<ChatMessage>,
    },
    SessionEnded {
        session_id: String,
        state: SessionState,
        reason: EndReason,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

impl From<SessionEvent> for ServerEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Matched {
                session_id,
                remote_peer,
                initiator,
                ..
            } => ServerEvent::Matched {
                session_id,
                remote_peer,
                initiator,
            },
            SessionEvent::Active {
                session_id,
                remote_stream,
                ..
            } => ServerEvent::SessionActive {
                session_id,
                remote_stream,
            },
            SessionEvent::Ended {
                session_id,
                state,
                reason,
                ..
            } => ServerEvent::SessionEnded {
                session_id,
                state,
                reason,
            },
        }
    }
}

impl From<SignalMessage> for ServerEvent {
    fn from(message: SignalMessage) -> Self {
        ServerEvent::Signal {
            session_id: message.session_id,
            sender: message.sender,
            kind: message.kind,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            sequence: message.sequence,
        }
    }
}

impl From<ChatMessage> for ServerEvent {
    fn from(message: ChatMessage) -> Self {
        ServerEvent::Chat {
            session_id: message.session_id,
            sender: message.sender,
            sequence: message.sequence,
            text: message.text,
            sent_at: message.sent_at,
        }
    }
}

impl From<RendezvousError> for ServerEvent {
    fn from(error: RendezvousError) -> Self {
        ServerEvent::Error {
            recoverable: error.is_recoverable(),
            message: error.to_string(),
        }
    }
}

// ============================================================================
// SERVER CONTEXT
// ============================================================================

/// Shared state for HTTP endpoints and sockets
pub struct ServerContext {
    pub rendezvous: Arc<Rendezvous>,
    pub node_name: String,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    node: String,
    version: String,
    uptime_seconds: u64,
    peers: usize,
    available: usize,
    queued: usize,
    live_sessions: usize,
    retained_sessions: usize,
}

#[derive(Deserialize)]
struct WsParams {
    peer_id: Option<String>,
}

// ============================================================================
// SERVER START
// ============================================================================

pub fn routes(
    ctx: Arc<ServerContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ctx_filter = warp::any().map({
        let ctx = ctx.clone();
        move || ctx.clone()
    });

    // 1. Health text at /
    let health_route = warp::path::end()
        .and(warp::get())
        .map(|| "callmatch rendezvous\n")
        .boxed();

    // 2. Counters at /api/status
    let status_route = warp::path!("api" / "status")
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_status)
        .boxed();

    // 3. One WebSocket per peer at /ws
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<WsParams>())
        .and(ctx_filter)
        .map(|ws: warp::ws::Ws, params: WsParams, ctx: Arc<ServerContext>| {
            ws.on_upgrade(move |socket| handle_connection(socket, params.peer_id, ctx))
        })
        .boxed();

    let cors = warp::cors().allow_any_origin();
    health_route.or(status_route).or(ws_route).with(cors)
}

pub async fn serve(addr: SocketAddr, ctx: Arc<ServerContext>) {
    info!(%addr, "Starting WebSocket + HTTP server");
    warp::serve(routes(ctx)).run(addr).await;
}

// ============================================================================
// API HANDLERS
// ============================================================================

async fn handle_status(ctx: Arc<ServerContext>) -> Result<impl warp::Reply, warp::Rejection> {
    let stats = ctx.rendezvous.stats();
    let response = StatusResponse {
        node: ctx.node_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.start_time.elapsed().as_secs(),
        peers: stats.peers,
        available: stats.available,
        queued: stats.queued,
        live_sessions: stats.live_sessions,
        retained_sessions: stats.retained_sessions,
    };
    Ok(warp::reply::json(&response))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn handle_connection(
    ws: warp::ws::WebSocket,
    requested_id: Option<String>,
    ctx: Arc<ServerContext>,
) {
    let (mut user_ws_tx, mut user_ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Task to forward outgoing events -> WebSocket
    let forward_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if user_ws_tx
                    .send(warp::ws::Message::text(json))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    let rendezvous = ctx.rendezvous.clone();
    // Subscribe before registering so no Matched event can slip past
    let events = rendezvous.subscribe_events();
    let peer_id = match rendezvous.register(requested_id) {
        Ok(peer) => peer.id,
        Err(e) => {
            let _ = out_tx.send(e.into());
            drop(out_tx);
            let _ = forward_task.await;
            return;
        }
    };
    let _ = out_tx.send(ServerEvent::Registered {
        peer_id: peer_id.clone(),
    });

    let event_task = tokio::spawn(route_events(
        rendezvous.clone(),
        peer_id.clone(),
        events,
        out_tx.clone(),
    ));

    // Handle WebSocket -> commands
    while let Some(result) = user_ws_rx.next().await {
        match result {
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    match serde_json::from_str::<ClientCommand>(text) {
                        Ok(cmd) => handle_command(&rendezvous, &peer_id, cmd, &out_tx).await,
                        Err(e) => {
                            let _ = out_tx.send(ServerEvent::Error {
                                message: format!("Malformed command: {}", e),
                                recoverable: true,
                            });
                        }
                    }
                } else if msg.is_close() {
                    break;
                }
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Dropping the socket cancels this peer's subscriptions only
    event_task.abort();
    if let Err(e) = rendezvous.deregister(&peer_id).await {
        debug!(peer_id = %peer_id, error = %e, "Peer already gone");
    }
    forward_task.abort();
    info!(peer_id = %peer_id, "Peer disconnected");
}

/// Forward this peer's session events, opening its signal and chat feeds
/// whenever it is matched.
async fn route_events(
    rendezvous: Arc<Rendezvous>,
    peer_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
    out: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut relays = JoinSet::new();
    let mut routed = RoutedSessions::default();
    loop {
        match events.recv().await {
            Ok(event) if event.peer_id() == peer_id => {
                match &event {
                    SessionEvent::Matched { session_id, .. } => {
                        // Already opened while catching up after a lag
                        if !routed.open(session_id) {
                            continue;
                        }
                        open_relays(&mut relays, &rendezvous, session_id, &peer_id, &out);
                    }
                    SessionEvent::Ended { session_id, .. } => {
                        if !routed.end(session_id) {
                            continue;
                        }
                    }
                    SessionEvent::Active { .. } => {}
                }
                if out.send(event.into()).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(peer_id = %peer_id, skipped, "Event stream lagged");
                let missed = catch_up(&mut routed, &mut relays, &rendezvous, &peer_id, &out);
                if missed.into_iter().any(|event| out.send(event).is_err()) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        // Reap relays of sessions that already ended
        while let Some(Some(_)) = relays.join_next().now_or_never() {}
    }
}

/// Sessions one connection has opened feeds for
#[derive(Default)]
struct RoutedSessions {
    opened: HashSet<SessionId>,
    live: HashSet<SessionId>,
}

impl RoutedSessions {
    /// False if this session was already opened
    fn open(&mut self, session_id: &str) -> bool {
        if !self.opened.insert(session_id.to_string()) {
            return false;
        }
        self.live.insert(session_id.to_string());
        true
    }

    /// False if the end was already reported
    fn end(&mut self, session_id: &str) -> bool {
        self.live.remove(session_id)
    }
}

/// Rebuild what skipped events would have told this peer: sessions that
/// ended unseen, and a match whose feeds were never opened.
fn catch_up(
    routed: &mut RoutedSessions,
    relays: &mut JoinSet<()>,
    rendezvous: &Rendezvous,
    peer_id: &str,
    out: &mpsc::UnboundedSender<ServerEvent>,
) -> Vec<ServerEvent> {
    let mut missed = Vec::new();

    let live: Vec<SessionId> = routed.live.iter().cloned().collect();
    for session_id in live {
        let session = match rendezvous.session(&session_id) {
            Ok(session) => session,
            Err(_) => {
                routed.end(&session_id);
                continue;
            }
        };
        if let (true, Some(reason)) = (session.is_terminal(), session.end_reason) {
            routed.end(&session_id);
            missed.push(ServerEvent::SessionEnded {
                session_id,
                state: session.state,
                reason,
            });
        }
    }

    if let Ok(Some(session)) = rendezvous.current_session(peer_id) {
        if routed.open(&session.id) {
            open_relays(relays, rendezvous, &session.id, peer_id, out);
            missed.push(ServerEvent::Matched {
                session_id: session.id.clone(),
                remote_peer: session.counterpart(peer_id).cloned().unwrap_or_default(),
                initiator: session.peer_a == peer_id,
            });
        }
    }
    missed
}

fn open_relays(
    relays: &mut JoinSet<()>,
    rendezvous: &Rendezvous,
    session_id: &str,
    peer_id: &str,
    out: &mpsc::UnboundedSender<ServerEvent>,
) {
    match rendezvous.receive_signals(session_id, peer_id) {
        Ok(subscription) => {
            let out = out.clone();
            relays.spawn(async move {
                let mut signals = Box::pin(subscription.into_stream());
                while let Some(message) = signals.next().await {
                    if out.send(message.into()).is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => debug!(session_id = %session_id, error = %e, "Signal feed not opened"),
    }

    match rendezvous.subscribe_chat(session_id, peer_id, 0) {
        Ok(mut subscription) => {
            let out = out.clone();
            relays.spawn(async move {
                while let Some(message) = subscription.next().await {
                    if out.send(message.into()).is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => debug!(session_id = %session_id, error = %e, "Chat feed not opened"),
    }
}

async fn handle_command(
    rendezvous: &Arc<Rendezvous>,
    peer_id: &str,
    cmd: ClientCommand,
    out: &mpsc::UnboundedSender<ServerEvent>,
) {
    let result: Result<Option<ServerEvent>, RendezvousError> = match cmd {
        ClientCommand::JoinQueue => {
            // Matched arrives through the event stream; only the timeout is reported here
            let rendezvous = rendezvous.clone();
            let peer_id = peer_id.to_string();
            let out = out.clone();
            tokio::spawn(async move {
                match rendezvous.join_queue(&peer_id).await {
                    Ok(_) => {}
                    Err(RendezvousError::NoPeerAvailable) => {
                        let _ = out.send(ServerEvent::NoPeerAvailable);
                    }
                    Err(e) => {
                        let _ = out.send(e.into());
                    }
                }
            });
            Ok(None)
        }
        ClientCommand::Signal {
            session_id,
            kind,
            payload,
        } => rendezvous
            .send_signal(&session_id, peer_id, kind, payload.into_bytes())
            .map(|_| None),
        ClientCommand::Ack {
            session_id,
            sequence,
        } => rendezvous
            .ack_signals(&session_id, peer_id, sequence)
            .map(|_| None),
        ClientCommand::Ready { session_id, stream } => rendezvous
            .mark_ready(&session_id, peer_id, stream)
            .await
            .map(|_| None),
        ClientCommand::MediaFailed { session_id } => rendezvous
            .report_media_failure(&session_id, peer_id)
            .await
            .map(|_| None),
        ClientCommand::HangUp { session_id } => rendezvous
            .hang_up(&session_id, peer_id)
            .await
            .map(|_| None),
        ClientCommand::Chat { session_id, text } => rendezvous
            .send_chat(&session_id, peer_id, &text)
            .map(|_| None),
        ClientCommand::History { session_id } => rendezvous
            .chat_history(&session_id)
            .map(|messages| Some(ServerEvent::History { session_id, messages })),
        ClientCommand::Heartbeat => rendezvous.heartbeat(peer_id).map(|_| None),
    };

    match result {
        Ok(Some(event)) => {
            let _ = out.send(event);
        }
        Ok(None) => {}
        Err(e) => {
            debug!(peer_id = %peer_id, error = %e, "Command rejected");
            let _ = out.send(e.into());
        }
    }
}
