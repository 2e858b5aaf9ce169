//! The in-memory signaling broker.
//!
//! The broker owns one [`TopicLog`] per topic and nothing else. It routes
//! pushes and pulls to the right log by inspecting the event's topic key and
//! lazily creates logs on first push. Logs are individually locked, so
//! traffic on distinct topics never contends; within one topic pushes,
//! pulls and gc are serialized.

use {
  crate::{
    event::{PullRequest, SignalingEvent},
    log::TopicLog,
  },
  metrics::{gauge, increment_counter},
  parking_lot::{Mutex, RwLock},
  std::{collections::HashMap, sync::Arc},
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error)]
pub enum Error {
  /// The request names neither a room nor a channel. Programmer error at
  /// the call site.
  #[error("pull request addresses no topic: roomId or channelId required")]
  MissingTopic,

  #[error("http transport error: {0}")]
  Http(#[from] reqwest::Error),
}

#[derive(Default)]
pub struct SignalBroker {
  topics: RwLock<HashMap<String, Arc<Mutex<TopicLog>>>>,
}

impl SignalBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an event to its topic's log, creating the log on first use.
  pub fn push(&self, event: SignalingEvent) {
    let topic = event.topic().to_owned();
    let log = self.log_for(&topic);
    debug!("push to {topic}: {event:?}");
    log.lock().push(event);
    increment_counter!("signaling_broker_pushes", "topic" => topic);
  }

  /// Reads events after the request's cursor from the addressed topic.
  ///
  /// A topic nobody has published to yet is not an error; the puller may
  /// simply be first to arrive, so it gets an empty window.
  pub fn pull(
    &self,
    request: &PullRequest,
  ) -> Result<Vec<SignalingEvent>, Error> {
    let topic = request.topic().ok_or(Error::MissingTopic)?;

    let log = {
      let topics = self.topics.read();
      match topics.get(topic) {
        Some(log) => Arc::clone(log),
        None => return Ok(Vec::new()),
      }
    };

    let events = log.lock().pull(request.after.as_ref());
    increment_counter!("signaling_broker_pulls", "topic" => topic.to_owned());
    Ok(events)
  }

  fn log_for(&self, topic: &str) -> Arc<Mutex<TopicLog>> {
    {
      let topics = self.topics.read();
      if let Some(log) = topics.get(topic) {
        return Arc::clone(log);
      }
    }

    let mut topics = self.topics.write();
    let log = Arc::clone(
      topics
        .entry(topic.to_owned())
        .or_insert_with(|| Arc::new(Mutex::new(TopicLog::new()))),
    );
    gauge!("signaling_broker_topics", topics.len() as f64);
    log
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::event::{ChannelId, EventId, PeerId, RoomId},
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
  fn routes_by_topic() {
    let broker = SignalBroker::new();
    broker.push(join("room-1", "alice"));
    broker.push(join("room-2", "bob"));

    let room1 = broker
      .pull(&PullRequest::room(RoomId::from("room-1"), None))
      .unwrap();
    assert_eq!(room1.len(), 1);
    assert_eq!(room1[0].peer_id().as_str(), "alice");

    let room2 = broker
      .pull(&PullRequest::room(RoomId::from("room-2"), None))
      .unwrap();
    assert_eq!(room2.len(), 1);
    assert_eq!(room2[0].peer_id().as_str(), "bob");
  }

  #[test]
  fn room_events_never_leak_into_channels() {
    let broker = SignalBroker::new();
    let room = RoomId::from("room-1");
    let channel = ChannelId::derive(
      &room,
      &PeerId::from("alice"),
      &PeerId::from("bob"),
    );
    broker.push(join("room-1", "alice"));

    let pulled = broker.pull(&PullRequest::channel(channel, None)).unwrap();
    assert!(pulled.is_empty());
  }

  #[test]
  fn pull_on_unknown_topic_is_empty() {
    let broker = SignalBroker::new();
    let pulled = broker
      .pull(&PullRequest::room(RoomId::from("nowhere"), None))
      .unwrap();
    assert!(pulled.is_empty());
  }

  #[test]
  fn pull_without_topic_is_rejected() {
    let broker = SignalBroker::new();
    let err = broker.pull(&PullRequest::default()).unwrap_err();
    assert!(matches!(err, Error::MissingTopic));
  }

  #[test]
  fn full_window_replay_returns_newest_entries() {
    let broker = SignalBroker::new();
    let ids: Vec<_> = (0..250)
      .map(|_| {
        let event = join("big-room", "alice");
        let id = event.id().clone();
        broker.push(event);
        id
      })
      .collect();

    let window = broker
      .pull(&PullRequest::room(RoomId::from("big-room"), None))
      .unwrap();
    assert_eq!(window.len(), 200);
    assert_eq!(window[0].id(), &ids[50]);
    assert_eq!(window[199].id(), &ids[249]);
  }

  #[test]
  fn channel_key_wins_over_room_key() {
    let broker = SignalBroker::new();
    let room = RoomId::from("room-1");
    let channel = ChannelId::derive(
      &room,
      &PeerId::from("alice"),
      &PeerId::from("bob"),
    );
    broker.push(SignalingEvent::SdpRestart {
      id: EventId::generate(),
      peer_id: PeerId::from("alice"),
      channel_id: channel.clone(),
    });

    let request = PullRequest {
      room_id: Some(room),
      channel_id: Some(channel),
      after: None,
    };
    assert_eq!(broker.pull(&request).unwrap().len(), 1);
  }
}
