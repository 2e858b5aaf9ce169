//! Presence scenarios: discovery through joins, heartbeats and leaves.

use {
  rendez_session::{
    loopback::LoopbackNetwork,
    Peer,
    PresenceKind,
    Room,
    RoomEvent,
    SessionConfig,
    TransportConfig,
  },
  rendez_signaling::{LocalTransport, SignalBroker},
  std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
  },
  tokio::{sync::broadcast, time::timeout},
};

fn fast_config() -> SessionConfig {
  SessionConfig {
    heartbeat_interval: Duration::from_millis(30),
    poll_interval_min: Duration::from_millis(5),
    poll_interval_max: Duration::from_millis(40),
    reconnect_base_delay: Duration::from_millis(5),
    reconnect_max_delay: Duration::from_millis(40),
    max_reconnect_attempts: 5,
  }
}

struct Rig {
  broker: Arc<SignalBroker>,
  network: LoopbackNetwork,
}

impl Rig {
  fn new() -> Self {
    Self {
      broker: Arc::new(SignalBroker::new()),
      network: LoopbackNetwork::new(),
    }
  }

  /// Every peer gets its own room handle onto the shared medium.
  fn room(&self, name: &str) -> Arc<Room> {
    Room::with_config(
      name,
      Arc::new(LocalTransport::new(Arc::clone(&self.broker))),
      self.network.factory(),
      fast_config(),
      TransportConfig::default(),
    )
  }
}

fn short_name(peer: &rendez_session::PeerId) -> String {
  peer.as_str().split('#').next().unwrap_or_default().to_owned()
}

/// Collects join presences until all expected names were seen.
async fn await_joins(
  events: &mut broadcast::Receiver<RoomEvent>,
  expected: &[&str],
  within: Duration,
) {
  let mut missing: HashSet<String> =
    expected.iter().map(|n| n.to_string()).collect();
  timeout(within, async {
    while !missing.is_empty() {
      if let RoomEvent::Presence { peer, kind } =
        events.recv().await.expect("room bus closed")
      {
        if kind == PresenceKind::Join {
          missing.remove(&short_name(&peer));
        }
      }
    }
  })
  .await
  .unwrap_or_else(|_| panic!("joins not observed, still missing {missing:?}"));
}

async fn await_leave(
  events: &mut broadcast::Receiver<RoomEvent>,
  name: &str,
  within: Duration,
) {
  timeout(within, async {
    loop {
      if let RoomEvent::Presence { peer, kind } =
        events.recv().await.expect("room bus closed")
      {
        if kind == PresenceKind::Leave && short_name(&peer) == name {
          return;
        }
      }
    }
  })
  .await
  .unwrap_or_else(|_| panic!("leave of {name} not observed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn three_peers_discover_each_other() {
  let rig = Rig::new();
  let names = ["Alice", "Bob", "Charlie"];

  let peers: Vec<_> = names.iter().map(|n| Peer::new(n)).collect();
  let rooms: Vec<_> = names.iter().map(|_| rig.room("test-room-1")).collect();
  let mut observers: Vec<_> = rooms.iter().map(|r| r.events()).collect();

  for (peer, room) in peers.iter().zip(&rooms) {
    peer.join(room).await.unwrap();
  }

  for observer in &mut observers {
    await_joins(observer, &names, Duration::from_secs(1)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn leavers_are_observed_and_go_silent() {
  let rig = Rig::new();
  let alice = Peer::new("Alice");
  let bob = Peer::new("Bob");
  let charlie = Peer::new("Charlie");

  let room_a = rig.room("test-room-1");
  let room_b = rig.room("test-room-1");
  let room_c = rig.room("test-room-1");

  let mut events_a = room_a.events();
  let mut events_b = room_b.events();
  let mut events_c = room_c.events();

  alice.join(&room_a).await.unwrap();
  bob.join(&room_b).await.unwrap();
  charlie.join(&room_c).await.unwrap();

  let names = ["Alice", "Bob", "Charlie"];
  await_joins(&mut events_a, &names, Duration::from_secs(1)).await;
  await_joins(&mut events_b, &names, Duration::from_secs(1)).await;
  await_joins(&mut events_c, &names, Duration::from_secs(1)).await;

  bob.leave(&room_b).await.unwrap();
  await_leave(&mut events_a, "Bob", Duration::from_secs(1)).await;
  await_leave(&mut events_c, "Bob", Duration::from_secs(1)).await;

  alice.leave(&room_a).await.unwrap();
  await_leave(&mut events_c, "Alice", Duration::from_secs(1)).await;

  // bob's loops are gone: his bus must stay silent about alice leaving
  let silent = timeout(Duration::from_millis(200), async {
    loop {
      if let Ok(RoomEvent::Presence { peer, kind }) = events_b.recv().await {
        if kind == PresenceKind::Leave && short_name(&peer) == "Alice" {
          return;
        }
      }
    }
  })
  .await;
  assert!(silent.is_err(), "bob observed a leave after leaving himself");
}

#[tokio::test(flavor = "multi_thread")]
async fn latecomer_sees_the_whole_room() {
  let rig = Rig::new();
  let early = Peer::new("Alice");
  let late = Peer::new("Dan");

  let room_a = rig.room("test-room-1");
  let room_d = rig.room("test-room-1");

  early.join(&room_a).await.unwrap();

  let mut events_d = room_d.events();
  late.join(&room_d).await.unwrap();
  await_joins(&mut events_d, &["Alice", "Dan"], Duration::from_secs(1)).await;
}
