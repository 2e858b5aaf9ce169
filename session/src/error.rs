use {
  rendez_signaling::event::{PeerId, RoomId},
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("signaling transport: {0}")]
  Signaling(#[from] rendez_signaling::Error),

  /// The caller tried to send before the pair's data channel opened.
  /// Gate on `wait_for_peers` / channel readiness first.
  #[error("data channel to {0} is not open")]
  DataChannelNotReady(PeerId),

  #[error("direct transport: {0}")]
  Transport(String),

  #[error("left room {0} before join completed")]
  Left(RoomId),

  #[error("payload encoding: {0}")]
  Encode(#[from] rmp_serde::encode::Error),

  #[error("payload decoding: {0}")]
  Decode(#[from] rmp_serde::decode::Error),
}
