use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream rejected the payload: http {0}")]
    Rejected(u16),
}

/// Cloud-side ingestion endpoint. One call per inbound message.
#[allow(async_fn_in_trait)]
pub trait UpstreamChannel {
    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<(), SendError>;
}

/// Hands normalized payloads to the upstream channel under a fixed channel
/// name.
pub struct ForwardingSink<U> {
    upstream: U,
    channel: String,
}

impl<U: UpstreamChannel> ForwardingSink<U> {
    pub fn new(upstream: U, channel: String) -> Self {
        Self { upstream, channel }
    }

    pub async fn forward(&self, payload: Vec<u8>) -> Result<(), SendError> {
        debug!("forwarding {} bytes to channel '{}'", payload.len(), self.channel);
        self.upstream.send(&self.channel, payload).await
    }
}

/// HTTP ingestion client: POSTs the payload bytes to `{base}/{channel}`.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

impl UpstreamChannel for HttpUpstream {
    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<(), SendError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), channel);
        let response = self.client.post(url).body(payload).send().await?;
        if !response.status().is_success() {
            return Err(SendError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
