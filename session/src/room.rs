//! A room is the named rendezvous scope: a signaling medium, a direct
//! transport binding, and a bus on which presence and user messages are
//! observed.
//!
//! The room itself holds no session state; the engine state lives in the
//! presence loop a peer creates for it.

use {
  crate::{
    bus::EventBus,
    config::{SessionConfig, TransportConfig},
    rtc::TransportFactory,
  },
  bytes::Bytes,
  rendez_signaling::{
    event::{PeerId, RoomId},
    SignalingTransport,
  },
  std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
  Join,
  Alive,
  Leave,
}

/// Everything observable about a room, including reflections of the local
/// peer's own activity.
#[derive(Clone)]
pub enum RoomEvent {
  /// A presence event was observed on the room topic. Emitted for every
  /// peer, the local one included.
  Presence { peer: PeerId, kind: PresenceKind },

  /// A user message arrived on a pair's data channel, or was sent by the
  /// local peer (senders observe their own messages too).
  Message { from: PeerId, payload: Bytes },

  /// The data channel to the given peer became ready for user traffic.
  ChannelReady { peer: PeerId },
}

impl std::fmt::Debug for RoomEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Presence { peer, kind } => f
        .debug_struct("Presence")
        .field("peer", peer)
        .field("kind", kind)
        .finish(),
      Self::Message { from, payload } => f
        .debug_struct("Message")
        .field("from", from)
        .field("len", &payload.len())
        .finish(),
      Self::ChannelReady { peer } => {
        f.debug_struct("ChannelReady").field("peer", peer).finish()
      }
    }
  }
}

pub struct Room {
  id: RoomId,
  signaling: Arc<dyn SignalingTransport>,
  factory: Arc<dyn TransportFactory>,
  transport_config: TransportConfig,
  config: SessionConfig,
  bus: EventBus<RoomEvent>,
}

impl Room {
  pub fn new(
    id: impl Into<RoomId>,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn TransportFactory>,
  ) -> Arc<Self> {
    Arc::new(Self {
      id: id.into(),
      signaling,
      factory,
      transport_config: TransportConfig::default(),
      config: SessionConfig::default(),
      bus: EventBus::default(),
    })
  }

  pub fn with_config(
    id: impl Into<RoomId>,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    transport_config: TransportConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      id: id.into(),
      signaling,
      factory,
      transport_config,
      config,
      bus: EventBus::default(),
    })
  }

  pub fn id(&self) -> &RoomId {
    &self.id
  }

  pub fn signaling(&self) -> &Arc<dyn SignalingTransport> {
    &self.signaling
  }

  pub fn factory(&self) -> &Arc<dyn TransportFactory> {
    &self.factory
  }

  pub fn transport_config(&self) -> &TransportConfig {
    &self.transport_config
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  /// The room's observation bus.
  pub fn bus(&self) -> &EventBus<RoomEvent> {
    &self.bus
  }

  /// Subscribes to presence, message and readiness events.
  pub fn events(&self) -> tokio::sync::broadcast::Receiver<RoomEvent> {
    self.bus.subscribe()
  }
}
