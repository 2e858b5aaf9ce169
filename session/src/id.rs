//! Peer identity scoped to the current process.
//!
//! Every peer id carries a random per-process suffix, so restarting a
//! process yields a fresh identity even when the caller reuses the same
//! name. A stale `alive` from the previous incarnation can then never be
//! mistaken for the new one.

use {
  once_cell::sync::Lazy,
  rand::{distributions::Alphanumeric, Rng},
  rendez_signaling::event::PeerId,
};

static PROCESS_TAG: Lazy<String> = Lazy::new(|| random_tag(6));

fn random_tag(len: usize) -> String {
  rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(len)
    .map(char::from)
    .collect()
}

/// The suffix shared by every peer id minted in this process.
pub fn process_tag() -> &'static str {
  &PROCESS_TAG
}

/// Scopes a caller-supplied name to this process incarnation.
pub fn scoped_peer_id(name: &str) -> PeerId {
  PeerId::new(format!("{name}#{}", *PROCESS_TAG))
}

/// A fresh anonymous identity.
pub fn random_peer_id() -> PeerId {
  scoped_peer_id(&format!("peer-{}", random_tag(4)))
}
