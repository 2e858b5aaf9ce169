mod broker;
mod http;
mod log;
mod transport;

pub mod event;

pub use {
  broker::{Error, SignalBroker},
  http::HttpTransport,
  log::{TopicLog, EXPIRY_WINDOW, MAX_QUEUE_SIZE},
  transport::{LocalTransport, SignalingTransport},
};
