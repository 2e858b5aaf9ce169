//! Bounded, time-expiring append-only log of signaling events for a single
//! topic.
//!
//! Retention is intentionally lossy in two ways: the log never holds more
//! than [`MAX_QUEUE_SIZE`] entries (oldest evicted first) and entries older
//! than [`EXPIRY_WINDOW`] are garbage collected on access. Consumers follow
//! the log with their own cursor and treat replayed events as no-ops, so
//! losing the cursor position only costs duplicate deliveries, never
//! deadlock.

use {
  crate::event::{EventId, SignalingEvent},
  metrics::increment_counter,
  std::{
    collections::VecDeque,
    time::{Duration, Instant},
  },
};

/// Upper bound on retained entries per topic.
pub const MAX_QUEUE_SIZE: usize = 200;

/// Entries older than this are dropped by [`TopicLog::gc`].
pub const EXPIRY_WINDOW: Duration = Duration::from_secs(120);

pub struct TopicLog {
  entries: VecDeque<(SignalingEvent, Instant)>,
  max_size: usize,
  expiry: Duration,
  last_gc: Instant,
}

impl Default for TopicLog {
  fn default() -> Self {
    Self::new()
  }
}

impl TopicLog {
  pub fn new() -> Self {
    Self::bounded(MAX_QUEUE_SIZE, EXPIRY_WINDOW)
  }

  /// A log with custom retention limits.
  pub fn bounded(max_size: usize, expiry: Duration) -> Self {
    Self {
      entries: VecDeque::with_capacity(max_size.min(64)),
      max_size,
      expiry,
      last_gc: Instant::now(),
    }
  }

  /// Appends an event, evicting the oldest entry once the size bound is
  /// exceeded.
  pub fn push(&mut self, event: SignalingEvent) {
    self.maybe_gc();
    self.entries.push_back((event, Instant::now()));
    if self.entries.len() > self.max_size {
      self.entries.pop_front();
      increment_counter!("signaling_log_evictions");
    }
  }

  /// Returns the suffix of events strictly after the given cursor, in push
  /// order.
  ///
  /// `None` returns the entire retained window. A cursor that is no longer
  /// in the window (already evicted or expired) also returns the entire
  /// window: failing open keeps slow consumers progressing, and their own
  /// cursor makes replays harmless.
  pub fn pull(&mut self, after: Option<&EventId>) -> Vec<SignalingEvent> {
    self.maybe_gc();
    let skip = match after {
      None => 0,
      Some(cursor) => {
        match self.entries.iter().position(|(e, _)| e.id() == cursor) {
          Some(index) => index + 1,
          None => 0,
        }
      }
    };
    self
      .entries
      .iter()
      .skip(skip)
      .map(|(e, _)| e.clone())
      .collect()
  }

  /// Drops entries older than the expiry window. Throttled to run at most
  /// once per window; callers invoke it opportunistically on every access.
  pub fn gc(&mut self) {
    let now = Instant::now();
    self.last_gc = now;
    let expiry = self.expiry;
    let before = self.entries.len();
    self
      .entries
      .retain(|(_, stamp)| now.duration_since(*stamp) < expiry);
    let dropped = before - self.entries.len();
    if dropped > 0 {
      increment_counter!("signaling_log_expired");
    }
  }

  fn maybe_gc(&mut self) {
    if self.last_gc.elapsed() >= self.expiry {
      self.gc();
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::event::{PeerId, RoomId},
  };

  fn join(room: &str, peer: &str) -> SignalingEvent {
    SignalingEvent::Join {
      id: EventId::generate(),
      peer_id: PeerId::from(peer),
      room_id: RoomId::from(room),
      sdp_offer: None,
    }
  }

  #[test]
  fn empty_log_pulls_nothing() {
    let mut log = TopicLog::new();
    assert!(log.pull(None).is_empty());
    assert!(log.pull(Some(&EventId::generate())).is_empty());
  }

  #[test]
  fn cursor_returns_contiguous_suffix() {
    let mut log = TopicLog::new();
    let events: Vec<_> = (0..5).map(|_| join("lobby", "alice")).collect();
    for event in &events {
      log.push(event.clone());
    }

    let tail = log.pull(Some(events[1].id()));
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0].id(), events[2].id());
    assert_eq!(tail[2].id(), events[4].id());

    // cursor at the newest entry yields nothing
    assert!(log.pull(Some(events[4].id())).is_empty());
  }

  #[test]
  fn unknown_cursor_fails_open_with_full_window() {
    let mut log = TopicLog::new();
    for _ in 0..3 {
      log.push(join("lobby", "alice"));
    }
    let evicted = EventId::generate();
    assert_eq!(log.pull(Some(&evicted)).len(), 3);
  }

  #[test]
  fn eviction_is_fifo() {
    let mut log = TopicLog::new();
    let events: Vec<_> =
      (0..MAX_QUEUE_SIZE + 50).map(|_| join("lobby", "alice")).collect();
    for event in &events {
      log.push(event.clone());
    }

    let window = log.pull(None);
    assert_eq!(window.len(), MAX_QUEUE_SIZE);
    assert_eq!(window[0].id(), events[50].id());
    assert_eq!(
      window[MAX_QUEUE_SIZE - 1].id(),
      events[MAX_QUEUE_SIZE + 49].id()
    );
  }

  #[test]
  fn expired_entries_are_dropped_on_access() {
    let mut log = TopicLog::bounded(MAX_QUEUE_SIZE, Duration::from_millis(20));
    log.push(join("lobby", "alice"));
    std::thread::sleep(Duration::from_millis(30));
    assert!(log.pull(None).is_empty());
  }

  #[test]
  fn fresh_entries_survive_gc() {
    let mut log = TopicLog::bounded(MAX_QUEUE_SIZE, Duration::from_secs(60));
    log.push(join("lobby", "alice"));
    log.gc();
    assert_eq!(log.len(), 1);
  }
}
