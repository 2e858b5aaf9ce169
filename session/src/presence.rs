//! Per (peer, room) presence engine.
//!
//! Two long-running tasks share one cancellation handle: the emit loop
//! announces the local peer on the room topic (one `join`, then periodic
//! `alive`s), the poll loop follows the topic with adaptive backoff and
//! classifies everything it reads. Every newly observed remote id births a
//! [`RemotePeerSession`] that negotiates the pair's direct channel on its
//! own topic.

use {
  crate::{
    codec,
    error::Error,
    room::{PresenceKind, Room, RoomEvent},
    session::RemotePeerSession,
  },
  futures::future::join_all,
  metrics::{gauge, increment_counter},
  parking_lot::Mutex,
  rendez_signaling::event::{EventId, PeerId, PullRequest, SignalingEvent},
  serde::Serialize,
  std::{
    collections::HashMap,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
  },
  tokio::time::sleep,
  tokio_util::sync::CancellationToken,
  tracing::{debug, info, warn},
};

pub struct RoomPresenceLoop {
  local_id: PeerId,
  room: Arc<Room>,
  started: AtomicBool,
  cancel: Mutex<CancellationToken>,
  remote_peers: Mutex<HashMap<PeerId, Arc<RemotePeerSession>>>,
  last_seen: Mutex<HashMap<PeerId, PresenceKind>>,
}

impl RoomPresenceLoop {
  pub(crate) fn new(local_id: PeerId, room: Arc<Room>) -> Arc<Self> {
    Arc::new(Self {
      local_id,
      room,
      started: AtomicBool::new(false),
      cancel: Mutex::new(CancellationToken::new()),
      remote_peers: Mutex::new(HashMap::new()),
      last_seen: Mutex::new(HashMap::new()),
    })
  }

  pub fn local_id(&self) -> &PeerId {
    &self.local_id
  }

  pub fn room(&self) -> &Arc<Room> {
    &self.room
  }

  /// The sessions of every remote peer observed so far.
  pub fn sessions(&self) -> Vec<Arc<RemotePeerSession>> {
    self.remote_peers.lock().values().cloned().collect()
  }

  /// Starts both loops and resolves once the local peer observes its own
  /// presence reflected from the room topic. Fails if the room is left
  /// before that happens.
  pub async fn join(self: &Arc<Self>) -> Result<(), Error> {
    if self.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    info!("{} joining room {}", self.local_id, self.room.id());
    increment_counter!("room_joins");

    let cancel = CancellationToken::new();
    *self.cancel.lock() = cancel.clone();

    // subscribe before the loops run so the reflection cannot be missed
    let mut events = self.room.bus().subscribe();

    self.spawn_emit_loop(cancel.clone());
    self.spawn_poll_loop(cancel.clone());

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          return Err(Error::Left(self.room.id().clone()));
        }
        event = events.recv() => match event {
          Ok(RoomEvent::Presence { peer, kind })
            if peer == self.local_id =>
          {
            return match kind {
              PresenceKind::Leave => {
                Err(Error::Left(self.room.id().clone()))
              }
              _ => Ok(()),
            };
          }
          Ok(_) => {}
          Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
          Err(tokio::sync::broadcast::error::RecvError::Closed) => {
            return Err(Error::Left(self.room.id().clone()));
          }
        },
      }
    }
  }

  /// Stops both loops, tears down every session, clears the peer maps and
  /// pushes one terminal `leave` so remote peers find out promptly.
  pub async fn leave(self: &Arc<Self>) -> Result<(), Error> {
    if !self.started.swap(false, Ordering::SeqCst) {
      return Ok(());
    }
    info!("{} leaving room {}", self.local_id, self.room.id());
    self.cancel.lock().cancel();

    let sessions: Vec<_> =
      self.remote_peers.lock().drain().map(|(_, s)| s).collect();
    join_all(sessions.iter().map(|s| s.disconnect())).await;
    self.last_seen.lock().clear();

    self
      .room
      .signaling()
      .push(SignalingEvent::Leave {
        id: EventId::generate(),
        peer_id: self.local_id.clone(),
        room_id: self.room.id().clone(),
      })
      .await?;
    Ok(())
  }

  /// Resolves once at least one remote session's data channel is ready,
  /// including sessions that were ready before the call.
  pub async fn wait_for_peers(self: &Arc<Self>) {
    let cancel = self.cancel.lock().clone();
    // subscribe before checking, so a channel opening in between is seen
    let mut events = self.room.bus().subscribe();

    if self
      .remote_peers
      .lock()
      .values()
      .any(|s| s.is_channel_ready())
    {
      return;
    }

    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        event = events.recv() => match event {
          Ok(RoomEvent::ChannelReady { .. }) => return,
          Ok(_) => {}
          Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
          Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        },
      }
    }
  }

  /// Encodes the message, fans it out over every ready pair and reflects
  /// it onto the local bus, so the sender observes its own message the
  /// same way everyone else does.
  pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), Error> {
    let payload = codec::encode(message)?;
    let sessions = self.sessions();

    let mut delivered = 0usize;
    let mut not_ready = None;
    for session in &sessions {
      match session.send(payload.clone()) {
        Ok(()) => delivered += 1,
        Err(err) => {
          debug!("skipping {}: {err}", session.other_peer());
          not_ready = Some(err);
        }
      }
    }
    if delivered == 0 {
      if let Some(err) = not_ready {
        return Err(err);
      }
    }

    increment_counter!("room_messages_sent");
    self.room.bus().emit(RoomEvent::Message {
      from: self.local_id.clone(),
      payload,
    });
    Ok(())
  }

  fn spawn_emit_loop(self: &Arc<Self>, cancel: CancellationToken) {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      let heartbeat = this.room.config().heartbeat_interval;
      let mut announced = 0u32;
      loop {
        let event = if announced == 0 {
          SignalingEvent::Join {
            id: EventId::generate(),
            peer_id: this.local_id.clone(),
            room_id: this.room.id().clone(),
            sdp_offer: None,
          }
        } else {
          SignalingEvent::Alive {
            id: EventId::generate(),
            peer_id: this.local_id.clone(),
            room_id: this.room.id().clone(),
          }
        };
        announced += 1;

        // a failed announce is not retried: the next heartbeat
        // resynchronizes
        if let Err(err) = this.room.signaling().push(event).await {
          warn!("{}: announce failed: {err}", this.room.id());
        }

        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = sleep(heartbeat) => {}
        }
      }
    });
  }

  fn spawn_poll_loop(self: &Arc<Self>, cancel: CancellationToken) {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      let config = this.room.config().clone();
      let mut backoff = config.poll_interval_min;
      let mut cursor: Option<EventId> = None;
      loop {
        let request =
          PullRequest::room(this.room.id().clone(), cursor.clone());
        match this.room.signaling().pull(request).await {
          Ok(events) => {
            backoff = if events.is_empty() {
              (backoff * 2).min(config.poll_interval_max)
            } else {
              config.poll_interval_min
            };
            for event in events {
              cursor = Some(event.id().clone());
              this.process(event).await;
            }
          }
          Err(err) => {
            // cursor stays put, the next poll re-reads the window
            warn!("{}: poll failed: {err}", this.room.id());
            backoff = (backoff * 2).min(config.poll_interval_max);
          }
        }
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = sleep(backoff) => {}
        }
      }
    });
  }

  /// Classifies one room-topic event and acts on it. Remote `join`s
  /// connect the pair's session, `alive`s keep it connected, `leave`s tear
  /// it down. Every event, the local peer's own included, is reflected as
  /// a presence event on the room bus.
  async fn process(self: &Arc<Self>, event: SignalingEvent) {
    let kind = match &event {
      SignalingEvent::Join { .. } => PresenceKind::Join,
      SignalingEvent::Alive { .. } => PresenceKind::Alive,
      SignalingEvent::Leave { .. } => PresenceKind::Leave,
      other => {
        debug!("{}: ignoring non-presence event: {other:?}", self.room.id());
        return;
      }
    };
    let peer = event.peer_id().clone();

    if peer != self.local_id {
      self.last_seen.lock().insert(peer.clone(), kind);
      match kind {
        PresenceKind::Join => {
          let session = self.session_for(&peer);
          if let Err(err) = session.connect().await {
            warn!("{peer}: connect failed: {err}");
          }
        }
        PresenceKind::Alive => {
          let session = self.session_for(&peer);
          if let Err(err) = session.ensure_connected().await {
            warn!("{peer}: connect failed: {err}");
          }
        }
        PresenceKind::Leave => {
          let session = self.remote_peers.lock().remove(&peer);
          if let Some(session) = session {
            info!("{peer} left {}", self.room.id());
            session.disconnect().await;
          }
        }
      }
      gauge!(
        "room_remote_peers",
        self.remote_peers.lock().len() as f64,
        "room" => self.room.id().to_string()
      );
    }

    self.room.bus().emit(RoomEvent::Presence { peer, kind });
  }

  /// The session for a remote id, created on first sight.
  fn session_for(&self, peer: &PeerId) -> Arc<RemotePeerSession> {
    let mut remote_peers = self.remote_peers.lock();
    if let Some(session) = remote_peers.get(peer) {
      return Arc::clone(session);
    }
    increment_counter!("room_sessions_created");
    let session = RemotePeerSession::new(
      self.local_id.clone(),
      peer.clone(),
      Arc::clone(&self.room),
    );
    remote_peers.insert(peer.clone(), Arc::clone(&session));
    session
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      config::{SessionConfig, TransportConfig},
      loopback::LoopbackNetwork,
    },
    rendez_signaling::{LocalTransport, SignalBroker},
    std::time::Duration,
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

  fn test_room(broker: &Arc<SignalBroker>, name: &str) -> Arc<Room> {
    Room::with_config(
      name,
      Arc::new(LocalTransport::new(Arc::clone(broker))),
      LoopbackNetwork::new().factory(),
      fast_config(),
      TransportConfig::default(),
    )
  }

  #[tokio::test]
  async fn join_resolves_on_own_reflection() {
    let broker = Arc::new(SignalBroker::new());
    let room = test_room(&broker, "solo");
    let presence =
      RoomPresenceLoop::new(PeerId::from("alice#1"), Arc::clone(&room));

    let mut events = room.events();
    presence.join().await.unwrap();

    loop {
      match events.recv().await.unwrap() {
        RoomEvent::Presence { peer, kind } => {
          assert_eq!(peer.as_str(), "alice#1");
          assert_eq!(kind, PresenceKind::Join);
          break;
        }
        _ => {}
      }
    }
    presence.leave().await.unwrap();
  }

  #[tokio::test]
  async fn terminal_leave_is_pushed_exactly_once() {
    let broker = Arc::new(SignalBroker::new());
    let room = test_room(&broker, "solo");
    let presence =
      RoomPresenceLoop::new(PeerId::from("alice#1"), Arc::clone(&room));

    presence.join().await.unwrap();
    presence.leave().await.unwrap();
    presence.leave().await.unwrap();

    let events = broker
      .pull(&PullRequest::room(room.id().clone(), None))
      .unwrap();
    let leaves = events
      .iter()
      .filter(|e| matches!(e, SignalingEvent::Leave { .. }))
      .count();
    assert_eq!(leaves, 1);
  }

  #[tokio::test]
  async fn loops_stop_announcing_after_leave() {
    let broker = Arc::new(SignalBroker::new());
    let room = test_room(&broker, "solo");
    let presence =
      RoomPresenceLoop::new(PeerId::from("alice#1"), Arc::clone(&room));

    presence.join().await.unwrap();
    presence.leave().await.unwrap();

    let before = broker
      .pull(&PullRequest::room(room.id().clone(), None))
      .unwrap()
      .len();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let after = broker
      .pull(&PullRequest::room(room.id().clone(), None))
      .unwrap()
      .len();
    assert_eq!(before, after);
  }
}
