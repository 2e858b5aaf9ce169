use std::time::Duration;

/// Timing knobs of the presence and negotiation loops.
///
/// The defaults are the protocol constants; tests shrink them to run the
/// same loops in milliseconds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
  /// Interval between presence announcements on the room topic. The first
  /// announcement is a `join`, every following one an `alive`.
  pub heartbeat_interval: Duration,

  /// Poll backoff floor. Polling restarts from here whenever a pull
  /// returns events.
  pub poll_interval_min: Duration,

  /// Poll backoff ceiling, reached by doubling on every empty pull.
  pub poll_interval_max: Duration,

  /// First reconnect attempt delay; doubles per attempt.
  pub reconnect_base_delay: Duration,

  /// Reconnect delay ceiling.
  pub reconnect_max_delay: Duration,

  /// Reconnect attempts before the session stays closed and waits for an
  /// external revival (a remote restart signal or a fresh join).
  pub max_reconnect_attempts: u8,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_secs(2),
      poll_interval_min: Duration::from_millis(100),
      poll_interval_max: Duration::from_secs(5),
      reconnect_base_delay: Duration::from_millis(10),
      reconnect_max_delay: Duration::from_secs(3),
      max_reconnect_attempts: 5,
    }
  }
}

/// How data channels are bundled onto underlying transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
  Balanced,
  MaxBundle,
  MaxCompat,
}

/// Configuration handed to the direct transport engine when a pair's
/// connection is created.
#[derive(Debug, Clone)]
pub struct TransportConfig {
  /// STUN/TURN server urls.
  pub ice_servers: Vec<String>,

  pub bundle_policy: BundlePolicy,

  /// Candidates the engine may gather ahead of negotiation.
  pub ice_candidate_pool_size: u8,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      ice_servers: vec!["stun:stun.l.google.com:19302".into()],
      bundle_policy: BundlePolicy::Balanced,
      ice_candidate_pool_size: 0,
    }
  }
}
