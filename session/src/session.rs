//! One session per remote peer discovered in a room.
//!
//! The session owns the pairwise negotiation topic and the local handles to
//! the direct transport. Which side drives is decided without coordination:
//! the peer whose id sorts first is the initiator and creates the offer,
//! the other answers. Both sides compute the same channel id, so the pair
//! shares one topic from either end.

use {
  crate::{
    bus::EventBus,
    error::Error,
    room::{Room, RoomEvent},
    rtc::{
      ChannelEvent,
      ChannelState,
      ConnectionState,
      DataChannelHandle,
      DirectTransport,
      TransportEvent,
    },
  },
  bytes::Bytes,
  metrics::increment_counter,
  parking_lot::Mutex,
  rendez_signaling::event::{
    ChannelId,
    EventId,
    PeerId,
    PullRequest,
    SignalingEvent,
  },
  std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
  },
  tokio::{sync::broadcast, time::sleep},
  tokio_util::sync::CancellationToken,
  tracing::{debug, info, warn},
};

const DATA_CHANNEL_LABEL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Creates the transport eagerly and sends the initial offer.
  Initiator,
  /// Waits for the offer and answers.
  Responder,
}

impl Role {
  /// The peer whose id sorts first initiates. Exactly one side offers, so
  /// two peers bringing the pair up concurrently can never glare.
  pub fn of(local: &PeerId, other: &PeerId) -> Self {
    if local < other {
      Self::Initiator
    } else {
      Self::Responder
    }
  }
}

/// Observational events; the presence loop and dashboards subscribe, the
/// protocol itself never depends on them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
  SentSignal(SignalingEvent),
  ReceivedSignal(SignalingEvent),
  DataChannel(ChannelEvent),
  PeerConnection(ConnectionState),
}

struct Handles {
  transport: Option<Arc<dyn DirectTransport>>,
  channel: Option<DataChannelHandle>,
  channel_ready: bool,
}

pub struct RemotePeerSession {
  local_id: PeerId,
  other_id: PeerId,
  channel_id: ChannelId,
  role: Role,
  room: Arc<Room>,
  connection_initialized: AtomicBool,
  reconnecting: AtomicBool,
  reconnect_attempts: AtomicU8,
  inner: Mutex<Handles>,
  /// Survives transport teardowns, so a restarted poll loop never replays
  /// (and re-acts on) negotiation events from a previous bringup round.
  signal_cursor: Mutex<Option<EventId>>,
  bus: EventBus<SessionEvent>,
  cancel: Mutex<CancellationToken>,
}

impl RemotePeerSession {
  pub(crate) fn new(
    local_id: PeerId,
    other_id: PeerId,
    room: Arc<Room>,
  ) -> Arc<Self> {
    let channel_id = ChannelId::derive(room.id(), &local_id, &other_id);
    let role = Role::of(&local_id, &other_id);
    Arc::new(Self {
      local_id,
      other_id,
      channel_id,
      role,
      room,
      connection_initialized: AtomicBool::new(false),
      reconnecting: AtomicBool::new(false),
      reconnect_attempts: AtomicU8::new(0),
      inner: Mutex::new(Handles {
        transport: None,
        channel: None,
        channel_ready: false,
      }),
      signal_cursor: Mutex::new(None),
      bus: EventBus::default(),
      cancel: Mutex::new(CancellationToken::new()),
    })
  }

  pub fn other_peer(&self) -> &PeerId {
    &self.other_id
  }

  pub fn channel_id(&self) -> &ChannelId {
    &self.channel_id
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn is_channel_ready(&self) -> bool {
    self.inner.lock().channel_ready
  }

  pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
    self.bus.subscribe()
  }

  /// Brings the pair's transport up. Idempotent: a second call while
  /// initialized does nothing.
  pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
    if self.connection_initialized.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    match self.bring_up().await {
      Ok(()) => Ok(()),
      Err(err) => {
        self.connection_initialized.store(false, Ordering::SeqCst);
        Err(err)
      }
    }
  }

  /// First call connects; every later call is a no-op while the
  /// connection is initialized.
  pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), Error> {
    self.connect().await
  }

  async fn bring_up(self: &Arc<Self>) -> Result<(), Error> {
    info!(
      "bringing up {} as {:?} towards {}",
      self.channel_id, self.role, self.other_id
    );
    increment_counter!("session_connects");

    let transport = self
      .room
      .factory()
      .create(self.room.transport_config())?;

    let cancel = CancellationToken::new();
    {
      let mut inner = self.inner.lock();
      inner.transport = Some(Arc::clone(&transport));
      inner.channel_ready = false;
    }
    *self.cancel.lock() = cancel.clone();

    self.spawn_transport_loop(Arc::clone(&transport), cancel.clone());
    self.spawn_signal_loop(cancel.clone());

    if self.role == Role::Initiator {
      let channel = transport.create_data_channel(DATA_CHANNEL_LABEL)?;
      self.adopt_channel(channel, cancel);
      let offer = transport.create_offer().await?;
      transport.set_local_description(offer.clone()).await?;
      self
        .push_signal(SignalingEvent::SdpOffer {
          id: EventId::generate(),
          peer_id: self.local_id.clone(),
          channel_id: self.channel_id.clone(),
          sdp: offer,
        })
        .await;
    }
    Ok(())
  }

  /// Tears down loops and transport handles. The session can be connected
  /// again afterwards, by the local side or by the next remote heartbeat.
  pub async fn disconnect(&self) {
    self.cancel.lock().cancel();
    let (transport, channel) = {
      let mut inner = self.inner.lock();
      inner.channel_ready = false;
      (inner.transport.take(), inner.channel.take())
    };
    if let Some(channel) = channel {
      channel.close();
    }
    if let Some(transport) = transport {
      transport.close().await;
    }
    self.connection_initialized.store(false, Ordering::SeqCst);
    debug!("{} torn down", self.channel_id);
  }

  /// Exponential-backoff renegotiation. Each attempt tears the transport
  /// down, tells the remote side to do the same, reconnects and waits out
  /// the attempt's delay for the data channel to come up. Gives up after
  /// the attempt budget; the next remote heartbeat revives the session
  /// through `ensure_connected`.
  pub async fn reconnect(self: &Arc<Self>) -> Result<(), Error> {
    if self.reconnecting.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let result = self.reconnect_rounds().await;
    self.reconnecting.store(false, Ordering::SeqCst);
    result
  }

  async fn reconnect_rounds(self: &Arc<Self>) -> Result<(), Error> {
    let config = self.room.config().clone();
    let mut delay = config.reconnect_base_delay;

    for attempt in 1..=config.max_reconnect_attempts {
      // a restart that raced a successful bringup has nothing to do; this
      // is what stops two peers from bouncing restarts at each other
      // forever
      if self.is_channel_ready() {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        return Ok(());
      }
      self.reconnect_attempts.store(attempt, Ordering::SeqCst);
      increment_counter!("session_reconnect_attempts");
      info!("{}: reconnect attempt {attempt}", self.channel_id);

      self.disconnect().await;
      self
        .push_signal(SignalingEvent::SdpRestart {
          id: EventId::generate(),
          peer_id: self.local_id.clone(),
          channel_id: self.channel_id.clone(),
        })
        .await;
      self.connect().await?;

      let mut events = self.bus.subscribe();
      if !self.is_channel_ready() {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
          tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
              Ok(SessionEvent::DataChannel(ChannelEvent::Open)) => break,
              Ok(_) => {}
              Err(broadcast::error::RecvError::Lagged(_)) => {}
              Err(broadcast::error::RecvError::Closed) => break,
            },
          }
        }
      }

      if self.is_channel_ready() {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        return Ok(());
      }
      delay = (delay * 2).min(config.reconnect_max_delay);
    }

    warn!("{}: reconnect budget exhausted", self.channel_id);
    self.disconnect().await;
    Err(Error::Transport("reconnect attempts exhausted".into()))
  }

  /// Sends an encoded user payload over the pair's data channel.
  pub fn send(&self, payload: Bytes) -> Result<(), Error> {
    let inner = self.inner.lock();
    match (&inner.channel, inner.channel_ready) {
      (Some(channel), true) => channel.send(payload),
      _ => Err(Error::DataChannelNotReady(self.other_id.clone())),
    }
  }

  fn transport(&self) -> Option<Arc<dyn DirectTransport>> {
    self.inner.lock().transport.clone()
  }

  async fn push_signal(&self, event: SignalingEvent) {
    match self.room.signaling().push(event.clone()).await {
      Ok(()) => self.bus.emit(SessionEvent::SentSignal(event)),
      // not retried here: the remote side resynchronizes on the next
      // heartbeat-driven connect
      Err(err) => warn!("{}: push failed: {err}", self.channel_id),
    }
  }

  fn spawn_signal_loop(self: &Arc<Self>, cancel: CancellationToken) {
    let session = Arc::clone(self);
    tokio::spawn(async move {
      let config = session.room.config().clone();
      let mut backoff = config.poll_interval_min;
      loop {
        let cursor = session.signal_cursor.lock().clone();
        let request =
          PullRequest::channel(session.channel_id.clone(), cursor);
        match session.room.signaling().pull(request).await {
          Ok(events) => {
            backoff = if events.is_empty() {
              (backoff * 2).min(config.poll_interval_max)
            } else {
              config.poll_interval_min
            };
            for event in events {
              *session.signal_cursor.lock() = Some(event.id().clone());
              if event.peer_id() == &session.local_id {
                continue;
              }
              session.handle_signal(event).await;
            }
          }
          Err(err) => {
            warn!("{}: pull failed: {err}", session.channel_id);
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

  async fn handle_signal(self: &Arc<Self>, event: SignalingEvent) {
    self.bus.emit(SessionEvent::ReceivedSignal(event.clone()));
    match event {
      SignalingEvent::SdpOffer { sdp, .. } => {
        if let Err(err) = self.accept_offer(sdp).await {
          warn!("{}: offer rejected: {err}", self.channel_id);
        }
      }
      SignalingEvent::SdpAnswer { sdp, .. } => {
        if let Err(err) = self.accept_answer(sdp).await {
          warn!("{}: answer rejected: {err}", self.channel_id);
        }
      }
      SignalingEvent::IceCandidate { candidate, .. } => {
        if let Some(transport) = self.transport() {
          if let Err(err) = transport.add_ice_candidate(candidate).await {
            warn!("{}: candidate rejected: {err}", self.channel_id);
          }
        }
      }
      SignalingEvent::SdpRestart { .. } => {
        if let Err(err) = self.reconnect().await {
          warn!("{}: restart failed: {err}", self.channel_id);
        }
      }
      other => {
        debug!("{}: ignoring presence event: {other:?}", self.channel_id);
      }
    }
  }

  async fn accept_offer(self: &Arc<Self>, sdp: String) -> Result<(), Error> {
    let transport = self
      .transport()
      .ok_or_else(|| Error::Transport("no active transport".into()))?;
    transport.set_remote_description(sdp).await?;
    let answer = transport.create_answer().await?;
    transport.set_local_description(answer.clone()).await?;
    self
      .push_signal(SignalingEvent::SdpAnswer {
        id: EventId::generate(),
        peer_id: self.local_id.clone(),
        channel_id: self.channel_id.clone(),
        sdp: answer,
      })
      .await;
    Ok(())
  }

  async fn accept_answer(self: &Arc<Self>, sdp: String) -> Result<(), Error> {
    let transport = self
      .transport()
      .ok_or_else(|| Error::Transport("no active transport".into()))?;
    let state_before = transport.connection_state();
    transport.set_remote_description(sdp).await?;
    if state_before == ConnectionState::New {
      // a late answer landed on a freshly recreated transport that never
      // offered; start a new round so the remote answers the real offer
      let offer = transport.create_offer().await?;
      transport.set_local_description(offer.clone()).await?;
      self
        .push_signal(SignalingEvent::SdpOffer {
          id: EventId::generate(),
          peer_id: self.local_id.clone(),
          channel_id: self.channel_id.clone(),
          sdp: offer,
        })
        .await;
    }
    Ok(())
  }

  fn spawn_transport_loop(
    self: &Arc<Self>,
    transport: Arc<dyn DirectTransport>,
    cancel: CancellationToken,
  ) {
    let session = Arc::clone(self);
    let mut events = transport.events();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          event = events.recv() => match event {
            Ok(TransportEvent::IceCandidate(Some(candidate))) => {
              session
                .push_signal(SignalingEvent::IceCandidate {
                  id: EventId::generate(),
                  peer_id: session.local_id.clone(),
                  channel_id: session.channel_id.clone(),
                  candidate,
                })
                .await;
            }
            Ok(TransportEvent::IceCandidate(None)) => {
              debug!("{}: candidate gathering done", session.channel_id);
            }
            Ok(TransportEvent::DataChannel(channel)) => {
              session.adopt_channel(channel, cancel.clone());
            }
            Ok(TransportEvent::ConnectionStateChange(state)) => {
              session.bus.emit(SessionEvent::PeerConnection(state));
              if state == ConnectionState::Failed {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                  if let Err(err) = session.reconnect().await {
                    warn!(
                      "{}: recovery failed: {err}",
                      session.channel_id
                    );
                  }
                });
              }
            }
            Ok(event) => debug!("{}: {event:?}", session.channel_id),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
              warn!("{}: dropped {skipped} transport events", session.channel_id);
            }
            Err(broadcast::error::RecvError::Closed) => break,
          },
        }
      }
    });
  }

  /// Takes ownership of a data channel, local or announced by the remote
  /// side, and mirrors its lifecycle onto the session and room buses.
  fn adopt_channel(
    self: &Arc<Self>,
    channel: DataChannelHandle,
    cancel: CancellationToken,
  ) {
    let mut events = channel.events();
    let already_open = channel.ready_state() == ChannelState::Open;
    {
      let mut inner = self.inner.lock();
      inner.channel = Some(channel);
      inner.channel_ready = already_open;
    }
    if already_open {
      self.announce_ready();
    }

    let session = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          event = events.recv() => match event {
            Ok(ChannelEvent::Open) => {
              session.inner.lock().channel_ready = true;
              session.announce_ready();
            }
            Ok(ChannelEvent::Message(payload)) => {
              session.bus.emit(SessionEvent::DataChannel(
                ChannelEvent::Message(payload.clone()),
              ));
              session.room.bus().emit(RoomEvent::Message {
                from: session.other_id.clone(),
                payload,
              });
            }
            Ok(ChannelEvent::Close) => {
              session.inner.lock().channel_ready = false;
              session
                .bus
                .emit(SessionEvent::DataChannel(ChannelEvent::Close));
            }
            Ok(ChannelEvent::Error(err)) => {
              warn!("{}: channel error: {err}", session.channel_id);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
          },
        }
      }
    });
  }

  fn announce_ready(&self) {
    increment_counter!("session_channels_ready");
    self
      .bus
      .emit(SessionEvent::DataChannel(ChannelEvent::Open));
    self.room.bus().emit(RoomEvent::ChannelReady {
      peer: self.other_id.clone(),
    });
  }
}
