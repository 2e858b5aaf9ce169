//! Defines the signaling protocol records exchanged between peers through
//! the broker. Events are self-describing tagged records so that any carrier
//! (in-process, HTTP, message bus) can ship them verbatim without knowing
//! their meaning.
//!
//! Every event addresses exactly one topic: presence events carry a room id,
//! negotiation events carry a channel id. A channel id embeds the room id,
//! so the two namespaces never collide.

use {
  rand::Rng,
  serde::{Deserialize, Serialize},
  std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
  },
};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Globally unique, time-sortable event identifier.
///
/// 26-character Crockford base32 string: 48 bits of milliseconds since the
/// unix epoch followed by 80 random bits. Lexicographic order on the string
/// representation is chronological order, which is what cursor-based pulls
/// rely on.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
  pub fn generate() -> Self {
    let now_ms = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_millis() as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.gen();
    let rand_lo: u64 = rng.gen();

    let mut buf = [0u8; 26];

    // timestamp, 10 chars, most significant first
    let mut ts = now_ms;
    for i in (0..10).rev() {
      buf[i] = CROCKFORD[(ts & 0x1f) as usize];
      ts >>= 5;
    }

    // 16 + 64 random bits, 16 chars
    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for i in (10..26).rev() {
      buf[i] = CROCKFORD[(r & 0x1f) as usize];
      r >>= 5;
    }

    Self(
      String::from_utf8(buf.to_vec())
        .expect("crockford alphabet is pure ascii"),
    )
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EventId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identity of a peer as seen on the wire.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PeerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PeerId {
  fn from(value: &str) -> Self {
    Self(value.to_owned())
  }
}

/// Name of a room. Room topics carry only presence events.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RoomId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RoomId {
  fn from(value: &str) -> Self {
    Self(value.to_owned())
  }
}

/// Name of the shared negotiation topic of one peer pair within a room.
///
/// Derived deterministically from `(room, peer, peer)`: the two peer ids are
/// sorted lexicographically and joined as `{room}:{lo}-{hi}`, so both sides
/// of a pair compute the same value without coordination.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
  pub fn derive(room: &RoomId, a: &PeerId, b: &PeerId) -> Self {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Self(format!("{room}:{lo}-{hi}"))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ChannelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Presence event on a room topic. Emitted by the heartbeat loop of every
/// joined peer and consumed by everyone polling the room.
///
/// `join` may piggyback an initial SDP offer for engines that support
/// eager negotiation; the field is carried verbatim and ignored otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingEvent {
  #[serde(rename_all = "camelCase")]
  Join {
    id: EventId,
    peer_id: PeerId,
    room_id: RoomId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sdp_offer: Option<String>,
  },

  #[serde(rename_all = "camelCase")]
  Alive {
    id: EventId,
    peer_id: PeerId,
    room_id: RoomId,
  },

  #[serde(rename_all = "camelCase")]
  Leave {
    id: EventId,
    peer_id: PeerId,
    room_id: RoomId,
  },

  /// Session description created by the initiator of a pair.
  #[serde(rename_all = "camelCase")]
  SdpOffer {
    id: EventId,
    peer_id: PeerId,
    channel_id: ChannelId,
    sdp: String,
  },

  /// Session description created by the responder of a pair.
  #[serde(rename_all = "camelCase")]
  SdpAnswer {
    id: EventId,
    peer_id: PeerId,
    channel_id: ChannelId,
    sdp: String,
  },

  /// Request to tear down and renegotiate the pair's transport.
  #[serde(rename_all = "camelCase")]
  SdpRestart {
    id: EventId,
    peer_id: PeerId,
    channel_id: ChannelId,
  },

  /// Trickled transport candidate, forwarded verbatim to the engine.
  #[serde(rename_all = "camelCase")]
  IceCandidate {
    id: EventId,
    peer_id: PeerId,
    channel_id: ChannelId,
    candidate: String,
  },
}

impl SignalingEvent {
  pub fn id(&self) -> &EventId {
    match self {
      Self::Join { id, .. }
      | Self::Alive { id, .. }
      | Self::Leave { id, .. }
      | Self::SdpOffer { id, .. }
      | Self::SdpAnswer { id, .. }
      | Self::SdpRestart { id, .. }
      | Self::IceCandidate { id, .. } => id,
    }
  }

  /// The peer that originated this event.
  pub fn peer_id(&self) -> &PeerId {
    match self {
      Self::Join { peer_id, .. }
      | Self::Alive { peer_id, .. }
      | Self::Leave { peer_id, .. }
      | Self::SdpOffer { peer_id, .. }
      | Self::SdpAnswer { peer_id, .. }
      | Self::SdpRestart { peer_id, .. }
      | Self::IceCandidate { peer_id, .. } => peer_id,
    }
  }

  /// The topic this event is addressed to. Structurally every event names
  /// exactly one topic, so this lookup cannot fail.
  pub fn topic(&self) -> &str {
    match self {
      Self::Join { room_id, .. }
      | Self::Alive { room_id, .. }
      | Self::Leave { room_id, .. } => room_id.as_str(),
      Self::SdpOffer { channel_id, .. }
      | Self::SdpAnswer { channel_id, .. }
      | Self::SdpRestart { channel_id, .. }
      | Self::IceCandidate { channel_id, .. } => channel_id.as_str(),
    }
  }

  pub fn is_presence(&self) -> bool {
    matches!(
      self,
      Self::Join { .. } | Self::Alive { .. } | Self::Leave { .. }
    )
  }
}

/// Cursor-based read request against one topic.
///
/// Exactly one of `room_id` / `channel_id` must be set. `after` is the id of
/// the last event the caller has consumed; `None` asks for the entire
/// currently retained window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub room_id: Option<RoomId>,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub channel_id: Option<ChannelId>,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub after: Option<EventId>,
}

impl PullRequest {
  pub fn room(room_id: RoomId, after: Option<EventId>) -> Self {
    Self {
      room_id: Some(room_id),
      channel_id: None,
      after,
    }
  }

  pub fn channel(channel_id: ChannelId, after: Option<EventId>) -> Self {
    Self {
      room_id: None,
      channel_id: Some(channel_id),
      after,
    }
  }

  /// Resolves the addressed topic key, channel id first.
  pub fn topic(&self) -> Option<&str> {
    self
      .channel_id
      .as_ref()
      .map(ChannelId::as_str)
      .or_else(|| self.room_id.as_ref().map(RoomId::as_str))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_ids_sort_chronologically() {
    let a = EventId::generate();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = EventId::generate();
    assert_eq!(a.as_str().len(), 26);
    assert!(a < b, "{a} should sort before {b}");
  }

  #[test]
  fn channel_id_is_symmetric() {
    let room = RoomId::from("lobby");
    let a = PeerId::from("alice#1");
    let b = PeerId::from("bob#2");
    assert_eq!(
      ChannelId::derive(&room, &a, &b),
      ChannelId::derive(&room, &b, &a)
    );
    assert_eq!(
      ChannelId::derive(&room, &a, &b).as_str(),
      "lobby:alice#1-bob#2"
    );
  }

  #[test]
  fn events_roundtrip_with_wire_tags() {
    let event = SignalingEvent::SdpOffer {
      id: EventId::generate(),
      peer_id: PeerId::from("alice#1"),
      channel_id: ChannelId::derive(
        &RoomId::from("lobby"),
        &PeerId::from("alice#1"),
        &PeerId::from("bob#2"),
      ),
      sdp: "v=0".into(),
    };

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "sdpOffer");
    assert_eq!(json["peerId"], "alice#1");
    assert_eq!(json["channelId"], "lobby:alice#1-bob#2");

    let back: SignalingEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back.topic(), event.topic());
  }

  #[test]
  fn join_omits_absent_offer() {
    let event = SignalingEvent::Join {
      id: EventId::generate(),
      peer_id: PeerId::from("alice#1"),
      room_id: RoomId::from("lobby"),
      sdp_offer: None,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "join");
    assert!(json.get("sdpOffer").is_none());
  }
}
