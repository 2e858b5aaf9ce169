//! Typed event fan-out used by rooms, sessions and transports.
//!
//! A thin layer over a broadcast channel. Subscribers are isolated from
//! each other by construction: a slow, dropped or panicking consumer can
//! never prevent siblings from observing an event. Dropping the receiver
//! disposes the subscription.

use {
  tokio::sync::broadcast,
  tokio_util::sync::CancellationToken,
};

const DEFAULT_CAPACITY: usize = 128;

#[derive(Clone)]
pub struct EventBus<T> {
  tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl<T: Clone + Send + 'static> EventBus<T> {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<T> {
    self.tx.subscribe()
  }

  /// Delivers the event to every live subscriber. An event with no
  /// subscribers is dropped, which is fine: observers that care subscribe
  /// before triggering the activity they observe.
  pub fn emit(&self, event: T) {
    let _ = self.tx.send(event);
  }

  /// One-shot future resolving on the first event matching the predicate.
  /// The underlying subscription is disposed when this resolves or is
  /// dropped.
  pub async fn wait_for(&self, matches: impl Fn(&T) -> bool) -> T {
    let mut rx = self.subscribe();
    loop {
      match rx.recv().await {
        Ok(event) if matches(&event) => return event,
        Ok(_) => {}
        // fell behind: skip to the live edge and keep matching
        Err(broadcast::error::RecvError::Lagged(_)) => {}
        Err(broadcast::error::RecvError::Closed) => {
          unreachable!("bus sender outlives waiters by construction")
        }
      }
    }
  }

  /// As [`Self::wait_for`] but wakes with `None` when the token fires, so
  /// pending waiters never outlive the entity they observe.
  pub async fn wait_for_cancellable(
    &self,
    cancel: &CancellationToken,
    matches: impl Fn(&T) -> bool,
  ) -> Option<T> {
    tokio::select! {
      _ = cancel.cancelled() => None,
      event = self.wait_for(matches) => Some(event),
    }
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::time::Duration};

  #[tokio::test]
  async fn delivers_to_every_subscriber() {
    let bus = EventBus::<u32>::default();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();
    bus.emit(7);
    assert_eq!(a.recv().await.unwrap(), 7);
    assert_eq!(b.recv().await.unwrap(), 7);
  }

  #[tokio::test]
  async fn dropped_subscriber_does_not_block_siblings() {
    let bus = EventBus::<u32>::default();
    let dropped = bus.subscribe();
    let mut live = bus.subscribe();
    drop(dropped);
    bus.emit(1);
    assert_eq!(live.recv().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn wait_for_skips_non_matching() {
    let bus = EventBus::<u32>::default();
    let waiter = tokio::spawn({
      let bus = bus.clone();
      async move { bus.wait_for(|n| *n > 2).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.emit(1);
    bus.emit(2);
    bus.emit(3);
    assert_eq!(waiter.await.unwrap(), 3);
  }

  #[tokio::test]
  async fn cancelled_waiters_wake_with_none() {
    let bus = EventBus::<u32>::default();
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
      let bus = bus.clone();
      let cancel = cancel.clone();
      async move { bus.wait_for_cancellable(&cancel, |_| true).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    assert_eq!(waiter.await.unwrap(), None);
  }
}
