use std::sync::Arc;
use std::time::Duration;

use cove_client_core::bus::SignalBus;
use cove_client_core::media::{LocalMedia, MediaConstraints};
use cove_client_core::transport::{
    ConnectionState, IceConnectionState, MockCall, MockScript, MockTransportFactory, PeerTransport,
};
use cove_client_core::{CallEvent, Orchestrator};
use cove_signal::keys;
use cove_signal::{
    Clock, IceCandidate, JoinMarker, ManualClock, MemoryStore, SdpKind, SessionDescription, Signal,
    SignalKind, SignalRelay, SignalStore, StoreRelay,
};
use tokio::sync::mpsc;

const ROOM: &str = "ROOM1";
const START: u64 = 1_000_000;

struct Room {
    clock: ManualClock,
    store: Arc<MemoryStore>,
    relay: Arc<dyn SignalRelay>,
}

impl Room {
    async fn open() -> Self {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        store
            .put_if_absent(&keys::room_key(ROOM), "1", Duration::from_secs(3600))
            .await
            .unwrap();
        let relay = Arc::new(StoreRelay::new(Arc::clone(&store), Arc::new(clock.clone())));
        Self { clock, store, relay }
    }

    fn join(&self, id: &str) -> Participant {
        self.join_with(id, MockScript::default(), Duration::from_secs(30))
    }

    fn join_with(&self, id: &str, script: MockScript, lookback: Duration) -> Participant {
        let factory = Arc::new(MockTransportFactory::new(id, script));
        let media = Arc::new(LocalMedia::new(format!("{id}-local"), MediaConstraints::default()));
        let (orchestrator, events) = Orchestrator::new(
            id,
            ROOM,
            Arc::clone(&self.relay),
            factory.clone(),
            media,
            1,
        );
        let bus = SignalBus::new(Arc::clone(&self.relay), ROOM, &self.clock, lookback);
        Participant {
            orchestrator,
            factory,
            bus,
            events,
        }
    }

    async fn signals(&self) -> Vec<Signal> {
        self.relay.fetch_since(ROOM, 0).await.unwrap()
    }
}

struct Participant {
    orchestrator: Orchestrator,
    factory: Arc<MockTransportFactory>,
    bus: SignalBus,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Participant {
    async fn poll(&mut self) -> usize {
        self.bus.poll_and_dispatch(&self.orchestrator).await
    }

    fn drain(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn connected_to(&self, peer: &str) -> bool {
        self.factory
            .latest(peer)
            .is_some_and(|t| t.connection_state() == ConnectionState::Connected)
    }

    fn offers_to(&self, peer: &str) -> usize {
        self.factory
            .transports_for(peer)
            .iter()
            .flat_map(|t| t.calls())
            .filter(|call| matches!(call, MockCall::CreateOffer { .. }))
            .count()
    }
}

/// Alternates polls with idle time so event pumps publish what they queued.
async fn settle(participants: &mut [&mut Participant]) {
    for _ in 0..6 {
        for participant in participants.iter_mut() {
            participant.poll().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn removed(events: &[CallEvent], peer: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CallEvent::RemoteStreamRemoved { peer_id } if peer_id == peer))
        .count()
}

async fn simultaneous_join(bob_polls_first: bool) {
    let room = Room::open().await;
    let mut bob = room.join("bob");
    let mut amy = room.join("amy");
    bob.orchestrator.announce().await;
    amy.orchestrator.announce().await;

    if bob_polls_first {
        settle(&mut [&mut bob, &mut amy]).await;
    } else {
        settle(&mut [&mut amy, &mut bob]).await;
    }

    // "bob" > "amy": bob calls, amy answers.
    assert_eq!(bob.offers_to("amy"), 1);
    assert_eq!(amy.offers_to("bob"), 0);
    assert_eq!(bob.factory.created_count(), 1);
    assert_eq!(amy.factory.created_count(), 1);
    assert!(bob.connected_to("amy"));
    assert!(amy.connected_to("bob"));

    let bob_events = bob.drain();
    assert!(bob_events.iter().any(|e| matches!(
        e,
        CallEvent::ConnectionStateChanged { peer_id, state: ConnectionState::Connected }
            if peer_id == "amy"
    )));
    let amy_streams: Vec<usize> = amy
        .drain()
        .iter()
        .filter_map(|e| match e {
            CallEvent::RemoteStreamAdded { peer_id, stream } if peer_id == "bob" => {
                Some(stream.tracks.len())
            }
            _ => None,
        })
        .collect();
    assert_eq!(amy_streams.last(), Some(&2));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn greater_identity_calls_when_initiator_polls_first() {
    simultaneous_join(true).await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn greater_identity_calls_when_waiter_polls_first() {
    simultaneous_join(false).await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn early_candidates_wait_for_the_offer() {
    let room = Room::open().await;
    let mut cat = room.join("cat");
    for n in 0..3 {
        let candidate = IceCandidate::new(format!("dan-c{n}"));
        room.relay
            .publish(ROOM, Signal::candidate("dan", "cat", candidate))
            .await
            .unwrap();
    }
    room.relay
        .publish(ROOM, Signal::offer("dan", "cat", SessionDescription::offer("v=0 dan")))
        .await
        .unwrap();

    assert_eq!(cat.poll().await, 4);

    assert_eq!(cat.factory.created_count(), 1);
    let transport = cat.factory.latest("dan").unwrap();
    assert_eq!(transport.applied_candidates(), vec!["dan-c0", "dan-c1", "dan-c2"]);
    let calls = transport.calls();
    let set_remote = calls
        .iter()
        .position(|c| *c == MockCall::SetRemote(SdpKind::Offer))
        .unwrap();
    let first_candidate = calls
        .iter()
        .position(|c| matches!(c, MockCall::AddCandidate(_)))
        .unwrap();
    assert!(set_remote < first_candidate);

    let answers: Vec<Signal> = room
        .signals()
        .await
        .into_iter()
        .filter(|s| s.kind() == SignalKind::Answer && s.sender == "cat")
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].target.as_deref(), Some("dan"));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failed_connection_restarts_then_fresh_join_replaces_entry() {
    let room = Room::open().await;
    let mut bob = room.join("bob");
    let mut amy = room.join("amy");
    bob.orchestrator.announce().await;
    amy.orchestrator.announce().await;
    settle(&mut [&mut bob, &mut amy]).await;
    let first = bob.factory.latest("amy").unwrap();
    let first_generation = bob.orchestrator.entry("amy").unwrap().generation();
    bob.drain();

    first.force_state(ConnectionState::Failed);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(first
        .calls()
        .contains(&MockCall::CreateOffer { ice_restart: true }));

    bob.orchestrator
        .handle_signal(Signal::join("amy", JoinMarker::fresh()).at(START + 60_000))
        .await;

    let transports = bob.factory.transports_for("amy");
    assert_eq!(transports.len(), 2);
    assert!(transports[0].is_closed());
    assert!(!transports[1].is_closed());
    let entry = bob.orchestrator.entry("amy").unwrap();
    assert_ne!(entry.generation(), first_generation);
    assert_eq!(removed(&bob.drain(), "amy"), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn refreshed_initiator_gets_a_fresh_entry_on_the_answerer() {
    let room = Room::open().await;
    let mut bob = room.join("bob");
    let mut amy = room.join("amy");
    bob.orchestrator.announce().await;
    amy.orchestrator.announce().await;
    settle(&mut [&mut bob, &mut amy]).await;
    assert!(amy.connected_to("bob"));
    let first_generation = amy.orchestrator.entry("bob").unwrap().generation();
    amy.drain();

    // bob reloads the page: same identity, brand-new connection, no leave.
    drop(bob);
    room.clock.set(START + 2_000);
    let mut bob = room.join("bob");
    bob.orchestrator.announce().await;
    settle(&mut [&mut bob, &mut amy]).await;

    let transports = amy.factory.transports_for("bob");
    assert_eq!(transports.len(), 2);
    assert!(transports[0].is_closed());
    assert!(!transports[1].is_closed());
    assert_ne!(amy.orchestrator.entry("bob").unwrap().generation(), first_generation);
    assert!(amy.connected_to("bob"));
    assert!(bob.connected_to("amy"));
    assert_eq!(removed(&amy.drain(), "bob"), 1);

    // bob applied amy's fresh answer, not the one left over from before the reload.
    let applied = bob.factory.latest("amy").unwrap().remote_description().await.unwrap();
    assert_eq!(applied.session_id(), Some(transports[1].session_id().as_str()));
    assert_eq!(bob.factory.created_count(), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn ice_disconnect_lets_a_fresh_join_replace_the_entry() {
    let room = Room::open().await;
    let mut bob = room.join("bob");
    let mut amy = room.join("amy");
    bob.orchestrator.announce().await;
    amy.orchestrator.announce().await;
    settle(&mut [&mut bob, &mut amy]).await;
    let first = bob.factory.latest("amy").unwrap();

    // A repeated join for a healthy entry changes nothing.
    bob.orchestrator
        .handle_signal(Signal::join("amy", JoinMarker::fresh()).at(START + 30_000))
        .await;
    assert_eq!(bob.factory.created_count(), 1);

    first.force_ice_state(IceConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(first.connection_state(), ConnectionState::Connected);
    assert!(!bob.orchestrator.entry("amy").unwrap().is_healthy());

    bob.orchestrator
        .handle_signal(Signal::join("amy", JoinMarker::fresh()).at(START + 60_000))
        .await;
    let transports = bob.factory.transports_for("amy");
    assert_eq!(transports.len(), 2);
    assert!(transports[0].is_closed());
    assert_eq!(bob.offers_to("amy"), 2);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn ice_restart_recovers_over_the_same_transport() {
    let room = Room::open().await;
    let mut bob = room.join("bob");
    let mut amy = room.join("amy");
    bob.orchestrator.announce().await;
    amy.orchestrator.announce().await;
    settle(&mut [&mut bob, &mut amy]).await;

    bob.factory
        .latest("amy")
        .unwrap()
        .force_state(ConnectionState::Failed);
    settle(&mut [&mut bob, &mut amy]).await;

    assert_eq!(bob.factory.created_count(), 1);
    assert_eq!(amy.factory.created_count(), 1);
    assert_eq!(bob.offers_to("amy"), 2);
    assert!(bob.connected_to("amy"));
    assert!(bob.orchestrator.entry("amy").unwrap().is_healthy());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn teardown_is_idempotent_during_inflight_offer() {
    let room = Room::open().await;
    let slow = MockScript {
        negotiation_delay: Some(Duration::from_millis(50)),
        ..MockScript::default()
    };
    let mut bob = room.join_with("bob", slow, Duration::from_secs(30));
    let orchestrator = bob.orchestrator.clone();
    let inflight = tokio::spawn(async move {
        orchestrator
            .handle_signal(Signal::join("amy", JoinMarker::fresh()).at(START))
            .await;
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(bob.orchestrator.peer_ids(), vec!["amy".to_string()]);

    tokio::join!(bob.orchestrator.shutdown(), bob.orchestrator.shutdown());
    bob.orchestrator.shutdown().await;
    inflight.await.unwrap();

    assert!(bob.orchestrator.is_closed());
    assert!(bob.orchestrator.peer_ids().is_empty());
    assert_eq!(bob.factory.open_count(), 0);
    assert!(bob.orchestrator.media().is_stopped());
    // The entry never carried media, so there is no stream to report gone.
    assert_eq!(removed(&bob.drain(), "amy"), 0);

    let signals = room.signals().await;
    let leaves = signals
        .iter()
        .filter(|s| s.kind() == SignalKind::Leave && s.sender == "bob")
        .count();
    assert_eq!(leaves, 1);
    assert!(!signals.iter().any(|s| s.kind() == SignalKind::Offer));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reconciliation_repairs_lost_joins() {
    let room = Room::open().await;
    let mut amy = room.join("amy");
    amy.orchestrator.announce().await;

    // bob arrives after amy's join fell out of his live window, and bob's own
    // join is lost by the relay.
    room.clock.set(START + 5_000);
    let mut bob = room.join_with("bob", MockScript::default(), Duration::from_secs(1));
    bob.orchestrator.announce().await;
    assert_eq!(room.store.forget_where(|key, _| key.contains(":join:bob:")), 1);

    settle(&mut [&mut bob, &mut amy]).await;
    assert!(bob.orchestrator.peer_ids().is_empty());
    assert!(amy.orchestrator.peer_ids().is_empty());

    for _ in 0..2 {
        let since = room.clock.now_millis() - 30_000;
        let recent = room.relay.fetch_since(ROOM, since).await.unwrap();
        bob.orchestrator.reconcile(&recent, Duration::from_secs(30)).await;
        amy.orchestrator.reconcile(&recent, Duration::from_secs(30)).await;
        settle(&mut [&mut bob, &mut amy]).await;
    }

    assert_eq!(bob.factory.created_count(), 1);
    assert_eq!(amy.factory.created_count(), 1);
    assert!(bob.connected_to("amy"));
    assert!(amy.connected_to("bob"));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn abandoned_holding_pen_is_dropped_by_reconciliation() {
    let room = Room::open().await;
    let mut cat = room.join("cat");
    room.relay
        .publish(ROOM, Signal::candidate("dan", "cat", IceCandidate::new("dan-c0")))
        .await
        .unwrap();
    cat.poll().await;
    assert_eq!(cat.orchestrator.peer_ids(), vec!["dan"]);

    let window = Duration::from_secs(30);
    let recent = room.signals().await;
    cat.orchestrator.reconcile(&recent, window).await;
    assert_eq!(cat.orchestrator.peer_ids(), vec!["dan"]);

    tokio::time::sleep(window).await;
    room.clock.set(START + 31_000);
    let since = room.clock.now_millis() - 30_000;
    let recent = room.relay.fetch_since(ROOM, since).await.unwrap();
    cat.orchestrator.reconcile(&recent, window).await;

    assert!(cat.orchestrator.peer_ids().is_empty());
    assert_eq!(cat.factory.open_count(), 0);
    assert_eq!(removed(&cat.drain(), "dan"), 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn leave_tears_down_only_that_peer() {
    let room = Room::open().await;
    let mut amy = room.join("amy");
    let mut bob = room.join("bob");
    let mut cat = room.join("cat");
    for participant in [&amy, &bob, &cat] {
        participant.orchestrator.announce().await;
    }
    settle(&mut [&mut cat, &mut bob, &mut amy]).await;

    assert_eq!(bob.orchestrator.peer_ids(), vec!["amy", "cat"]);
    for (me, peers) in [(&amy, ["bob", "cat"]), (&bob, ["amy", "cat"]), (&cat, ["amy", "bob"])] {
        for peer in peers {
            assert!(me.connected_to(peer), "{peer} not connected");
        }
    }
    bob.drain();
    cat.drain();

    amy.orchestrator.shutdown().await;
    settle(&mut [&mut cat, &mut bob]).await;

    assert_eq!(bob.orchestrator.peer_ids(), vec!["cat"]);
    assert_eq!(cat.orchestrator.peer_ids(), vec!["bob"]);
    assert!(bob.connected_to("cat"));
    assert_eq!(removed(&bob.drain(), "amy"), 1);
    assert_eq!(removed(&cat.drain(), "amy"), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn foreign_and_loopback_signals_are_ignored() {
    let room = Room::open().await;
    let mut amy = room.join("amy");
    room.relay
        .publish(ROOM, Signal::offer("cat", "bob", SessionDescription::offer("v=0")))
        .await
        .unwrap();
    room.relay
        .publish(ROOM, Signal::offer("amy", "amy", SessionDescription::offer("v=0")))
        .await
        .unwrap();
    amy.poll().await;
    assert_eq!(amy.factory.created_count(), 0);
    assert!(amy.orchestrator.peer_ids().is_empty());
}
