// Integration test: coordinator invariants under random and concurrent load
//
// - FIFO pairing of the longest-waiting peers
// - No peer is ever in two live sessions
// - Concurrent matchers never hand out a peer twice
// - Signal and chat ordering as seen by subscribers
// - Terminal sessions reject relay operations without changing

use callmatch_core::{
    Matchmaker, Registry, Rendezvous, RendezvousConfig, RendezvousError, SessionState,
    SignalKind,
};
use futures::StreamExt;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Deregister(u8),
    Match,
    HangUp(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8).prop_map(Op::Register),
        (0u8..8).prop_map(Op::Deregister),
        Just(Op::Match),
        (0u8..8).prop_map(Op::HangUp),
    ]
}

fn peer_name(i: u8) -> String {
    format!("peer-{}", i)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_pairs_longest_waiting_first(count in 2usize..24) {
        let registry = Arc::new(Registry::new());
        let matchmaker = Matchmaker::new(registry.clone());
        for i in 0..count {
            let id = format!("p{:02}", i);
            registry.register(Some(id.clone())).unwrap();
            matchmaker.enqueue(&id).unwrap();
        }

        let mut pairs = Vec::new();
        while let Ok(pair) = matchmaker.try_match() {
            pairs.push((pair.initiator, pair.responder));
        }

        prop_assert_eq!(pairs.len(), count / 2);
        for (n, (initiator, responder)) in pairs.iter().enumerate() {
            prop_assert_eq!(initiator, &format!("p{:02}", 2 * n));
            prop_assert_eq!(responder, &format!("p{:02}", 2 * n + 1));
        }
    }

    #[test]
    fn prop_no_peer_in_two_live_sessions(ops in prop::collection::vec(op_strategy(), 1..60)) {
        runtime().block_on(async {
            let rv = Rendezvous::new(RendezvousConfig::default());

            for op in ops {
                match op {
                    Op::Register(i) => {
                        let _ = rv.register(Some(peer_name(i)));
                    }
                    Op::Deregister(i) => {
                        let _ = rv.deregister(&peer_name(i)).await;
                    }
                    Op::Match => {
                        let _ = rv.try_match();
                    }
                    Op::HangUp(i) => {
                        let held = rv.peer(&peer_name(i)).ok().and_then(|p| p.session_id);
                        if let Some(session_id) = held {
                            rv.hang_up(&session_id, &peer_name(i)).await.unwrap();
                        }
                    }
                }

                let mut members = HashSet::new();
                for session in rv.sessions().iter().filter(|s| !s.is_terminal()) {
                    assert!(members.insert(session.peer_a.clone()), "{} in two sessions", session.peer_a);
                    assert!(members.insert(session.peer_b.clone()), "{} in two sessions", session.peer_b);
                    assert_ne!(session.peer_a, session.peer_b);
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matchers_never_share_a_peer() {
    let rv = Arc::new(Rendezvous::new(RendezvousConfig::default()));
    for i in 0..64 {
        rv.register(Some(format!("peer-{}", i))).unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let rv = rv.clone();
        workers.push(tokio::spawn(async move {
            let mut won = Vec::new();
            loop {
                match rv.try_match() {
                    Ok(session) => won.push(session),
                    Err(RendezvousError::NoPeerAvailable) => break,
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
            won
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for session in worker.await.unwrap() {
            total += 1;
            assert!(seen.insert(session.peer_a.clone()));
            assert!(seen.insert(session.peer_b.clone()));
        }
    }
    assert_eq!(total, 32);
    assert_eq!(seen.len(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chat_total_order_is_shared() {
    let rv = Arc::new(Rendezvous::new(RendezvousConfig::default()));
    rv.register(Some("a".into())).unwrap();
    rv.register(Some("b".into())).unwrap();
    let session = rv.try_match().unwrap();
    rv.mark_ready(&session.id, "a", None).await.unwrap();
    rv.mark_ready(&session.id, "b", None).await.unwrap();

    let feed_a = rv.subscribe_chat(&session.id, "a", 0).unwrap();
    let feed_b = rv.subscribe_chat(&session.id, "b", 0).unwrap();

    let mut posters = Vec::new();
    for sender in ["a", "b"] {
        let rv = rv.clone();
        let session_id = session.id.clone();
        posters.push(tokio::spawn(async move {
            for n in 0..50 {
                rv.send_chat(&session_id, sender, &format!("{sender}-{n}")).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for poster in posters {
        poster.await.unwrap();
    }
    rv.hang_up(&session.id, "a").await.unwrap();

    let seen_a: Vec<_> = feed_a.into_stream().map(|m| (m.sequence, m.text)).collect().await;
    let seen_b: Vec<_> = feed_b.into_stream().map(|m| (m.sequence, m.text)).collect().await;

    assert_eq!(seen_a.len(), 100);
    assert_eq!(seen_a, seen_b);
    let sequences: Vec<u64> = seen_a.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, (1..=100).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_signal_sequences_increase_per_sender() {
    let rv = Rendezvous::new(RendezvousConfig::default());
    rv.register(Some("a".into())).unwrap();
    rv.register(Some("b".into())).unwrap();
    let session = rv.try_match().unwrap();

    let mut inbox = rv.receive_signals(&session.id, "b").unwrap();
    let mut next = tokio_test::task::spawn(inbox.next());
    assert_pending!(next.poll());

    rv.send_signal(&session.id, "a", SignalKind::Offer, b"offer".to_vec()).unwrap();
    assert!(next.is_woken());
    let first = assert_ready!(next.poll()).unwrap();
    assert_eq!(first.sequence, 1);
    drop(next);

    for n in 0..20u8 {
        rv.send_signal(&session.id, "a", SignalKind::Candidate, vec![n]).unwrap();
    }
    rv.hang_up(&session.id, "b").await.unwrap();

    let mut last = first.sequence;
    let mut delivered = HashMap::new();
    while let Some(message) = inbox.next().await {
        assert!(message.sequence > last);
        last = message.sequence;
        *delivered.entry(message.sequence).or_insert(0) += 1;
    }
    assert_eq!(delivered.len(), 20);
    assert!(delivered.values().all(|count| *count == 1));
}

#[tokio::test]
async fn test_terminal_session_rejects_operations() {
    let rv = Rendezvous::new(RendezvousConfig::default());
    rv.register(Some("a".into())).unwrap();
    rv.register(Some("b".into())).unwrap();
    let session = rv.try_match().unwrap();
    rv.report_media_failure(&session.id, "b").await.unwrap();

    let before = rv.session(&session.id).unwrap();
    assert_eq!(before.state, SessionState::Failed);

    assert_eq!(
        rv.send_signal(&session.id, "a", SignalKind::Offer, vec![]),
        Err(RendezvousError::SessionClosed)
    );
    assert!(matches!(
        rv.receive_signals(&session.id, "a"),
        Err(RendezvousError::SessionClosed)
    ));
    assert_eq!(
        rv.ack_signals(&session.id, "a", 1),
        Err(RendezvousError::SessionClosed)
    );
    assert_eq!(
        rv.send_chat(&session.id, "a", "hello"),
        Err(RendezvousError::SessionClosed)
    );
    assert_eq!(
        rv.mark_ready(&session.id, "a", None).await,
        Err(RendezvousError::SessionClosed)
    );
    assert_eq!(
        rv.report_media_failure(&session.id, "a").await,
        Err(RendezvousError::SessionClosed)
    );
    assert_eq!(rv.hang_up(&session.id, "a").await.unwrap(), before);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(rv.session(&session.id).unwrap(), before);
}
