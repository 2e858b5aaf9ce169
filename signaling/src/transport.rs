//! The abstract carrier of signaling events.
//!
//! The engine never talks to a broker directly, only through this contract,
//! so the same presence and negotiation machinery runs unchanged whether the
//! medium is an in-process broker shared between tasks or a request/response
//! hop over a network. Implementations must be safe to retry: pushes may be
//! duplicated by upstream recovery and pullers dedupe through their own
//! cursor.

use {
  crate::{
    broker::{Error, SignalBroker},
    event::{PullRequest, SignalingEvent},
  },
  async_trait::async_trait,
  std::sync::Arc,
};

#[async_trait]
pub trait SignalingTransport: Send + Sync {
  /// Delivers one event to its addressed topic.
  async fn push(&self, event: SignalingEvent) -> Result<(), Error>;

  /// Returns events strictly after `request.after` from the addressed
  /// topic, in push order. A `None` cursor reads the entire retained
  /// window.
  async fn pull(
    &self,
    request: PullRequest,
  ) -> Result<Vec<SignalingEvent>, Error>;
}

/// In-process transport: all peers sharing one broker instance see each
/// other. This is the medium used by tests and by same-process peers.
#[derive(Clone)]
pub struct LocalTransport {
  broker: Arc<SignalBroker>,
}

impl LocalTransport {
  pub fn new(broker: Arc<SignalBroker>) -> Self {
    Self { broker }
  }

  pub fn broker(&self) -> &Arc<SignalBroker> {
    &self.broker
  }
}

#[async_trait]
impl SignalingTransport for LocalTransport {
  async fn push(&self, event: SignalingEvent) -> Result<(), Error> {
    self.broker.push(event);
    Ok(())
  }

  async fn pull(
    &self,
    request: PullRequest,
  ) -> Result<Vec<SignalingEvent>, Error> {
    self.broker.pull(&request)
  }
}
