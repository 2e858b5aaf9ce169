//! Structure-preserving codec for user payloads.
//!
//! Messages cross the data channel as MessagePack with named fields, so
//! maps, sequences, binary blobs and timestamps survive the round trip and
//! either side can evolve independently of field order.

use {
  crate::error::Error,
  bytes::Bytes,
  serde::{de::DeserializeOwned, Serialize},
};

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, Error> {
  Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Error> {
  Ok(rmp_serde::from_slice(payload)?)
}
