mod bus;
mod codec;
mod config;
mod error;
mod id;
mod peer;
mod presence;
mod room;
mod session;

pub mod loopback;
pub mod rtc;

pub use {
  bus::EventBus,
  bytes::Bytes,
  codec::{decode, encode},
  config::{BundlePolicy, SessionConfig, TransportConfig},
  error::Error,
  id::{process_tag, random_peer_id, scoped_peer_id},
  peer::Peer,
  presence::RoomPresenceLoop,
  rendez_signaling::event::{ChannelId, EventId, PeerId, RoomId},
  room::{PresenceKind, Room, RoomEvent},
  session::{RemotePeerSession, Role, SessionEvent},
};
