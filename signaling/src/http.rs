//! Request/response signaling transport over HTTP GET.
//!
//! Events and pull requests travel JSON-encoded in a query parameter, so a
//! broker can sit behind any plain HTTP endpoint or function host. The
//! response to a pull is a JSON array of events.
//!
//! Failure policy: a timed-out pull resolves to an empty window instead of
//! an error, because the poll loop's natural retry subsumes recovery. Every
//! other failure is surfaced and handled by the caller's retry.

use {
  crate::{
    broker::Error,
    event::{PullRequest, SignalingEvent},
    transport::SignalingTransport,
  },
  async_trait::async_trait,
  std::time::Duration,
  tracing::warn,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpTransport {
  client: reqwest::Client,
  endpoint: String,
}

impl HttpTransport {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      client: reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("default reqwest client configuration is valid"),
      endpoint: endpoint.into(),
    }
  }
}

#[async_trait]
impl SignalingTransport for HttpTransport {
  async fn push(&self, event: SignalingEvent) -> Result<(), Error> {
    self
      .client
      .get(&self.endpoint)
      .query(&[(
        "event",
        serde_json::to_string(&event).expect("events are plain data"),
      )])
      .send()
      .await?
      .error_for_status()?;
    Ok(())
  }

  async fn pull(
    &self,
    request: PullRequest,
  ) -> Result<Vec<SignalingEvent>, Error> {
    let response = self
      .client
      .get(&self.endpoint)
      .query(&[(
        "pull",
        serde_json::to_string(&request).expect("requests are plain data"),
      )])
      .send()
      .await;

    let response = match response {
      Ok(response) => response,
      Err(err) if err.is_timeout() => {
        warn!("signaling pull timed out, treating as empty window");
        return Ok(Vec::new());
      }
      Err(err) => return Err(err.into()),
    };

    Ok(response.error_for_status()?.json().await?)
  }
}
