//! The local peer: a process-scoped identity owning one presence engine
//! per room.

use {
  crate::{error::Error, id, presence::RoomPresenceLoop, room::Room},
  parking_lot::Mutex,
  rendez_signaling::event::{PeerId, RoomId},
  std::{collections::HashMap, sync::Arc},
};

pub struct Peer {
  id: PeerId,
  rooms: Mutex<HashMap<RoomId, Arc<RoomPresenceLoop>>>,
}

impl Peer {
  /// A peer named by the caller. The name is scoped with the process tag,
  /// so two processes (or two incarnations of one) can never collide.
  pub fn new(name: &str) -> Self {
    Self {
      id: id::scoped_peer_id(name),
      rooms: Mutex::new(HashMap::new()),
    }
  }

  /// A peer with a generated name.
  pub fn anonymous() -> Self {
    Self {
      id: id::random_peer_id(),
      rooms: Mutex::new(HashMap::new()),
    }
  }

  pub fn id(&self) -> &PeerId {
    &self.id
  }

  /// The presence engine for a room, created on first use. One engine per
  /// room id: asking again for the same room returns the same engine.
  pub fn room(&self, room: &Arc<Room>) -> Arc<RoomPresenceLoop> {
    let mut rooms = self.rooms.lock();
    if let Some(existing) = rooms.get(room.id()) {
      return Arc::clone(existing);
    }
    let engine = RoomPresenceLoop::new(self.id.clone(), Arc::clone(room));
    rooms.insert(room.id().clone(), Arc::clone(&engine));
    engine
  }

  /// Shorthand: take (or create) the room's engine and join.
  pub async fn join(
    &self,
    room: &Arc<Room>,
  ) -> Result<Arc<RoomPresenceLoop>, Error> {
    let engine = self.room(room);
    engine.join().await?;
    Ok(engine)
  }

  /// Leaves the room and drops its engine.
  pub async fn leave(&self, room: &Arc<Room>) -> Result<(), Error> {
    let engine = self.rooms.lock().remove(room.id());
    match engine {
      Some(engine) => engine.leave().await,
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{config::SessionConfig, loopback::LoopbackNetwork},
    rendez_signaling::{LocalTransport, SignalBroker},
  };

  fn test_room(name: &str) -> Arc<Room> {
    Room::with_config(
      name,
      Arc::new(LocalTransport::new(Arc::new(SignalBroker::new()))),
      LoopbackNetwork::new().factory(),
      SessionConfig::default(),
      Default::default(),
    )
  }

  #[test]
  fn one_engine_per_room_id() {
    let peer = Peer::new("alice");
    let room = test_room("lobby");
    let first = peer.room(&room);
    let second = peer.room(&room);
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[test]
  fn peer_ids_are_process_scoped() {
    let peer = Peer::new("alice");
    assert!(peer.id().as_str().starts_with("alice#"));
  }
}
