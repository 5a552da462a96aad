// Demo: replays the five call scenarios against an in-process coordinator
//
// Useful as a smoke test of a build: every step prints what happened and
// the run fails on the first unexpected outcome.

use anyhow::{bail, Context, Result};
use callmatch_core::{
    PeerStatus, Rendezvous, RendezvousConfig, RendezvousError, SessionState, SignalKind,
};
use chrono::{DateTime, Local, TimeZone};
use colored::*;
use std::time::Duration;

fn step(title: &str) {
    println!();
    println!("{}", title.bold());
}

fn ok(line: String) {
    println!("  {} {}", "✓".green(), line);
}

fn clock(unix_ms: u64) -> String {
    let time: Option<DateTime<Local>> = Local.timestamp_millis_opt(unix_ms as i64).single();
    time.map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| unix_ms.to_string())
}

pub async fn run() -> Result<()> {
    println!("{}", "callmatch demo".bold().bright_cyan());

    let rv = Rendezvous::new(RendezvousConfig {
        negotiation_timeout_ms: 300,
        ..RendezvousConfig::default()
    });

    step("1. Register and match");
    rv.register(Some("P1".into()))?;
    rv.register(Some("P2".into()))?;
    let session = rv.try_match().context("two available peers should match")?;
    ok(format!(
        "Session {} is {} ({} calls {})",
        session.id.bright_cyan(),
        session.state,
        session.peer_a,
        session.peer_b
    ));

    step("2. Relay an offer");
    let sequence = rv.send_signal(&session.id, "P1", SignalKind::Offer, b"O1".to_vec())?;
    let mut inbox = rv.receive_signals(&session.id, "P2")?;
    let offer = tokio::time::timeout(Duration::from_secs(1), inbox.next())
        .await
        .context("offer was not delivered")?
        .context("signal stream ended early")?;
    ok(format!(
        "P2 received {:?} #{} from {}: {}",
        offer.kind,
        sequence,
        offer.sender,
        String::from_utf8_lossy(&offer.payload).bright_yellow()
    ));
    rv.ack_signals(&session.id, "P2", offer.sequence)?;

    step("3. Go active and chat");
    rv.mark_ready(&session.id, "P1", None).await?;
    let state = rv.mark_ready(&session.id, "P2", None).await?;
    ok(format!("Session is {}", state));
    rv.send_chat(&session.id, "P1", "hi")?;
    for message in rv.chat_history(&session.id)? {
        ok(format!(
            "[{}] #{} {}: {}",
            clock(message.sent_at).dimmed(),
            message.sequence,
            message.sender,
            message.text
        ));
    }

    step("4. Peer leaves mid-call");
    rv.deregister("P2").await?;
    let ended = rv.session(&session.id)?;
    ok(format!(
        "Session is {} ({:?})",
        ended.state,
        ended.end_reason
    ));
    match rv.send_chat(&session.id, "P1", "anyone?") {
        Err(RendezvousError::SessionClosed) => ok("Chat after the end is refused".to_string()),
        other => bail!("expected SessionClosed, got {:?}", other),
    }

    step("5. Nobody gets ready");
    rv.register(Some("P3".into()))?;
    let stalled = rv.try_match().context("P1 and P3 should match")?;
    ok(format!("Session {} negotiating", stalled.id.bright_cyan()));
    let failed = rv.wait_terminal(&stalled.id).await?;
    if failed.state != SessionState::Failed {
        bail!("expected Failed, got {}", failed.state);
    }
    ok(format!("Session is {} ({:?})", failed.state, failed.end_reason));
    for id in ["P1", "P3"] {
        let peer = rv.peer(id)?;
        if peer.status != PeerStatus::Available {
            bail!("{} should be Available again", id);
        }
        ok(format!("{} is {:?}", id, peer.status));
    }

    rv.shutdown().await;
    println!();
    println!("{}", "All scenarios passed".green().bold());
    Ok(())
}
