//! Contract of the direct peer-to-peer transport engine.
//!
//! The engine that actually moves user bytes (a platform WebRTC stack or a
//! stand-in like [`crate::loopback`]) is an external capability. Sessions
//! only drive its negotiation surface: offers, answers, candidates, data
//! channels and state changes. Binding a concrete engine means implementing
//! these three traits.

use {
  crate::{config::TransportConfig, error::Error},
  async_trait::async_trait,
  bytes::Bytes,
  std::{fmt, sync::Arc},
  tokio::sync::broadcast,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  New,
  Connecting,
  Connected,
  Disconnected,
  Failed,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
  Stable,
  HaveLocalOffer,
  HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Connecting,
  Open,
  Closing,
  Closed,
}

pub type DataChannelHandle = Arc<dyn DataChannel>;

/// Events emitted by a transport while negotiation progresses.
#[derive(Clone)]
pub enum TransportEvent {
  /// A locally gathered candidate to trickle to the remote side; `None`
  /// marks the end of gathering.
  IceCandidate(Option<String>),

  /// A channel announced by the remote side.
  DataChannel(DataChannelHandle),

  ConnectionStateChange(ConnectionState),
  IceConnectionStateChange(ConnectionState),
  SignalingStateChange(SignalingState),
  NegotiationNeeded,
  Track,
}

impl fmt::Debug for TransportEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
      Self::DataChannel(ch) => {
        f.debug_tuple("DataChannel").field(&ch.label()).finish()
      }
      Self::ConnectionStateChange(s) => {
        f.debug_tuple("ConnectionStateChange").field(s).finish()
      }
      Self::IceConnectionStateChange(s) => {
        f.debug_tuple("IceConnectionStateChange").field(s).finish()
      }
      Self::SignalingStateChange(s) => {
        f.debug_tuple("SignalingStateChange").field(s).finish()
      }
      Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
      Self::Track => f.write_str("Track"),
    }
  }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
  Open,
  Closing,
  Close,
  Error(String),
  Message(Bytes),
  BufferedAmountLow,
}

#[async_trait]
pub trait DirectTransport: Send + Sync {
  async fn create_offer(&self) -> Result<String, Error>;

  async fn create_answer(&self) -> Result<String, Error>;

  async fn set_local_description(&self, sdp: String) -> Result<(), Error>;

  async fn set_remote_description(&self, sdp: String) -> Result<(), Error>;

  async fn add_ice_candidate(&self, candidate: String) -> Result<(), Error>;

  /// Opens an outbound channel; the remote side learns about it through a
  /// [`TransportEvent::DataChannel`] once connected.
  fn create_data_channel(
    &self,
    label: &str,
  ) -> Result<DataChannelHandle, Error>;

  fn connection_state(&self) -> ConnectionState;

  fn events(&self) -> broadcast::Receiver<TransportEvent>;

  async fn close(&self);
}

pub trait DataChannel: Send + Sync {
  fn label(&self) -> &str;

  fn ready_state(&self) -> ChannelState;

  /// Hard error unless the channel is open.
  fn send(&self, payload: Bytes) -> Result<(), Error>;

  fn close(&self);

  fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// Seam through which the embedder supplies the platform engine. One
/// transport is created per remote peer per bringup attempt.
pub trait TransportFactory: Send + Sync {
  fn create(
    &self,
    config: &TransportConfig,
  ) -> Result<Arc<dyn DirectTransport>, Error>;
}
