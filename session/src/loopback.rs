//! In-process implementation of the direct transport contract.
//!
//! Endpoints of one [`LoopbackNetwork`] rendezvous through tokens embedded
//! in their exchanged session descriptions, exactly the way real engines
//! rendezvous through SDP, and then shuttle frames over in-memory channels.
//! This is the engine behind the end-to-end test suites and the reference
//! for binding a platform stack.
//!
//! All cross-endpoint mutations happen under the network's registry lock,
//! so linking two endpoints can never deadlock or observe half-linked
//! state.

use {
  crate::{
    config::TransportConfig,
    error::Error,
    rtc::{
      ChannelEvent,
      ChannelState,
      ConnectionState,
      DataChannel,
      DataChannelHandle,
      DirectTransport,
      SignalingState,
      TransportEvent,
      TransportFactory,
    },
  },
  async_trait::async_trait,
  bytes::Bytes,
  parking_lot::Mutex,
  rand::{distributions::Alphanumeric, Rng},
  std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
  },
  tokio::sync::broadcast,
  tracing::debug,
};

const EVENT_CAPACITY: usize = 64;

/// The shared medium. Transports created from clones of one network can
/// reach each other; distinct networks are fully isolated.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
  registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
  endpoints: HashMap<String, Weak<Endpoint>>,
}

impl LoopbackNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn factory(&self) -> Arc<LoopbackFactory> {
    Arc::new(LoopbackFactory {
      network: self.clone(),
    })
  }
}

pub struct LoopbackFactory {
  network: LoopbackNetwork,
}

impl TransportFactory for LoopbackFactory {
  fn create(
    &self,
    _config: &TransportConfig,
  ) -> Result<Arc<dyn DirectTransport>, Error> {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let endpoint = Arc::new(Endpoint {
      token: random_token(),
      network: self.network.clone(),
      events,
      state: Mutex::new(EndpointState {
        connection: ConnectionState::New,
        local_desc: None,
        remote_desc: None,
        peer: None,
        channels: Vec::new(),
        remote_candidates: Vec::new(),
      }),
    });
    Ok(Arc::new(LoopbackTransport { endpoint }))
  }
}

fn random_token() -> String {
  let tag: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(12)
    .map(char::from)
    .collect();
  format!("ep-{tag}")
}

fn describe(kind: &str, token: &str) -> String {
  format!("loopback:{kind}:{token}")
}

fn token_of(sdp: &str) -> Option<&str> {
  sdp.rsplit(':').next().filter(|t| t.starts_with("ep-"))
}

struct Endpoint {
  token: String,
  network: LoopbackNetwork,
  events: broadcast::Sender<TransportEvent>,
  state: Mutex<EndpointState>,
}

struct EndpointState {
  connection: ConnectionState,
  local_desc: Option<String>,
  remote_desc: Option<String>,
  peer: Option<Weak<Endpoint>>,
  channels: Vec<Arc<ChannelCore>>,
  remote_candidates: Vec<String>,
}

impl Endpoint {
  fn emit(&self, event: TransportEvent) {
    let _ = self.events.send(event);
  }

  /// Both descriptions present and the peer resolvable means this side of
  /// the link is up: flip to connected and mirror locally created channels
  /// onto the peer. Runs under the registry lock.
  fn try_link(self: &Arc<Self>) {
    let peer = {
      let state = self.state.lock();
      if state.connection == ConnectionState::Connected
        || state.local_desc.is_none()
        || state.remote_desc.is_none()
      {
        return;
      }
      match state.peer.as_ref().and_then(Weak::upgrade) {
        Some(peer) => peer,
        None => return,
      }
    };

    {
      let mut state = self.state.lock();
      state.connection = ConnectionState::Connected;
    }
    debug!("loopback {} linked to {}", self.token, peer.token);
    self.emit(TransportEvent::ConnectionStateChange(
      ConnectionState::Connected,
    ));
    self.emit(TransportEvent::IceConnectionStateChange(
      ConnectionState::Connected,
    ));

    // hand unmirrored local channels to the peer
    let channels: Vec<_> = self.state.lock().channels.clone();
    for channel in channels {
      if channel.peer.lock().is_some() {
        continue;
      }
      let mirror = Arc::new(ChannelCore::new(channel.label.clone()));
      *channel.peer.lock() = Some(Arc::downgrade(&mirror));
      *mirror.peer.lock() = Some(Arc::downgrade(&channel));
      peer.state.lock().channels.push(Arc::clone(&mirror));

      peer.emit(TransportEvent::DataChannel(Arc::new(LoopbackChannel {
        core: Arc::clone(&mirror),
      })));
      channel.open();
      mirror.open();
    }
  }
}

struct ChannelCore {
  label: String,
  state: Mutex<ChannelState>,
  peer: Mutex<Option<Weak<ChannelCore>>>,
  events: broadcast::Sender<ChannelEvent>,
  /// Frames delivered before anyone subscribed; flushed to the first
  /// subscriber so a racing adopt never loses data.
  pending: Mutex<VecDeque<Bytes>>,
}

impl ChannelCore {
  fn new(label: String) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      label,
      state: Mutex::new(ChannelState::Connecting),
      peer: Mutex::new(None),
      events,
      pending: Mutex::new(VecDeque::new()),
    }
  }

  fn open(&self) {
    *self.state.lock() = ChannelState::Open;
    let _ = self.events.send(ChannelEvent::Open);
  }

  fn deliver(&self, payload: Bytes) {
    let mut pending = self.pending.lock();
    if self.events.receiver_count() == 0 {
      pending.push_back(payload);
      return;
    }
    while let Some(buffered) = pending.pop_front() {
      let _ = self.events.send(ChannelEvent::Message(buffered));
    }
    let _ = self.events.send(ChannelEvent::Message(payload));
  }

  fn shutdown(&self) {
    let mut state = self.state.lock();
    if *state == ChannelState::Closed {
      return;
    }
    *state = ChannelState::Closed;
    drop(state);
    let _ = self.events.send(ChannelEvent::Close);
  }
}

pub struct LoopbackChannel {
  core: Arc<ChannelCore>,
}

impl DataChannel for LoopbackChannel {
  fn label(&self) -> &str {
    &self.core.label
  }

  fn ready_state(&self) -> ChannelState {
    *self.core.state.lock()
  }

  fn send(&self, payload: Bytes) -> Result<(), Error> {
    if *self.core.state.lock() != ChannelState::Open {
      return Err(Error::Transport("data channel is not open".into()));
    }
    let peer = self
      .core
      .peer
      .lock()
      .as_ref()
      .and_then(Weak::upgrade)
      .ok_or_else(|| Error::Transport("remote endpoint is gone".into()))?;
    peer.deliver(payload);
    Ok(())
  }

  fn close(&self) {
    if let Some(peer) = self.core.peer.lock().as_ref().and_then(Weak::upgrade)
    {
      peer.shutdown();
    }
    self.core.shutdown();
  }

  fn events(&self) -> broadcast::Receiver<ChannelEvent> {
    let rx = self.core.events.subscribe();
    let mut pending = self.core.pending.lock();
    while let Some(buffered) = pending.pop_front() {
      let _ = self.core.events.send(ChannelEvent::Message(buffered));
    }
    rx
  }
}

pub struct LoopbackTransport {
  endpoint: Arc<Endpoint>,
}

#[async_trait]
impl DirectTransport for LoopbackTransport {
  async fn create_offer(&self) -> Result<String, Error> {
    Ok(describe("offer", &self.endpoint.token))
  }

  async fn create_answer(&self) -> Result<String, Error> {
    if self.endpoint.state.lock().remote_desc.is_none() {
      return Err(Error::Transport(
        "cannot answer without a remote offer".into(),
      ));
    }
    Ok(describe("answer", &self.endpoint.token))
  }

  async fn set_local_description(&self, sdp: String) -> Result<(), Error> {
    let registry = self.endpoint.network.registry.clone();
    let mut registry = registry.lock();
    registry
      .endpoints
      .insert(self.endpoint.token.clone(), Arc::downgrade(&self.endpoint));

    let signaling = {
      let mut state = self.endpoint.state.lock();
      if state.connection == ConnectionState::New {
        state.connection = ConnectionState::Connecting;
      }
      let signaling = if sdp.contains(":offer:") {
        SignalingState::HaveLocalOffer
      } else {
        SignalingState::Stable
      };
      state.local_desc = Some(sdp);
      signaling
    };

    self
      .endpoint
      .emit(TransportEvent::SignalingStateChange(signaling));

    // trickle one synthetic candidate, then end-of-gathering
    self.endpoint.emit(TransportEvent::IceCandidate(Some(format!(
      "candidate:{} 1 udp 2113937151 127.0.0.1 0 typ host",
      self.endpoint.token
    ))));
    self.endpoint.emit(TransportEvent::IceCandidate(None));

    self.endpoint.try_link();
    Ok(())
  }

  async fn set_remote_description(&self, sdp: String) -> Result<(), Error> {
    let registry = self.endpoint.network.registry.clone();
    let registry = registry.lock();

    let signaling = {
      let mut state = self.endpoint.state.lock();
      // an unknown token stays unresolved: the remote endpoint may be gone
      // already, which surfaces as a link that never comes up
      state.peer = token_of(&sdp)
        .and_then(|token| registry.endpoints.get(token))
        .cloned();
      let signaling = if sdp.contains(":offer:") {
        SignalingState::HaveRemoteOffer
      } else {
        SignalingState::Stable
      };
      state.remote_desc = Some(sdp);
      signaling
    };

    self
      .endpoint
      .emit(TransportEvent::SignalingStateChange(signaling));
    self.endpoint.try_link();

    // the other side may have been waiting for us to register; resolve it
    // outside our own state lock before poking it
    let peer = {
      let state = self.endpoint.state.lock();
      state.peer.as_ref().and_then(Weak::upgrade)
    };
    if let Some(peer) = peer {
      peer.try_link();
    }
    Ok(())
  }

  async fn add_ice_candidate(&self, candidate: String) -> Result<(), Error> {
    self.endpoint.state.lock().remote_candidates.push(candidate);
    Ok(())
  }

  fn create_data_channel(
    &self,
    label: &str,
  ) -> Result<DataChannelHandle, Error> {
    let core = Arc::new(ChannelCore::new(label.to_owned()));
    self.endpoint.state.lock().channels.push(Arc::clone(&core));
    Ok(Arc::new(LoopbackChannel { core }))
  }

  fn connection_state(&self) -> ConnectionState {
    self.endpoint.state.lock().connection
  }

  fn events(&self) -> broadcast::Receiver<TransportEvent> {
    self.endpoint.events.subscribe()
  }

  async fn close(&self) {
    let registry = self.endpoint.network.registry.clone();
    let mut registry = registry.lock();
    registry.endpoints.remove(&self.endpoint.token);

    let (channels, peer) = {
      let mut state = self.endpoint.state.lock();
      if state.connection == ConnectionState::Closed {
        return;
      }
      state.connection = ConnectionState::Closed;
      (
        std::mem::take(&mut state.channels),
        state.peer.take().and_then(|p| p.upgrade()),
      )
    };

    for channel in channels {
      if let Some(far) = channel.peer.lock().as_ref().and_then(Weak::upgrade)
      {
        far.shutdown();
      }
      channel.shutdown();
    }

    self
      .endpoint
      .emit(TransportEvent::ConnectionStateChange(ConnectionState::Closed));

    if let Some(peer) = peer {
      let mut state = peer.state.lock();
      if state.connection == ConnectionState::Connected {
        state.connection = ConnectionState::Disconnected;
        drop(state);
        peer.emit(TransportEvent::ConnectionStateChange(
          ConnectionState::Disconnected,
        ));
      }
    }
  }
}
