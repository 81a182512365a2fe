use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::util::ServerId;

/// Why a single scrape produced no payload.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered, but not with 200 OK.
    #[error("unexpected status {0}")]
    Status(u16),

    /// Connection refused, timeout, reset while reading the body, ...
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Fetcher is the abstraction over ONE outbound scrape.
///
/// Implementations must:
/// - Issue exactly one request per call
/// - Never retry internally (retry cadence belongs to the schedule)
/// - Treat the payload as opaque bytes
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One instance is shared by every collector and every tick
///
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Pulls `http://{host}:{port}/metrics` from `server`.
    async fn fetch(&self, server: &ServerId) -> Result<Bytes, FetchError>;
}

/// reqwest-backed fetcher.
///
/// The client is built once and reused, so connections to servers
/// scraped every tick stay pooled.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, server: &ServerId) -> Result<Bytes, FetchError> {
        let url = server.metrics_url();
        log::debug!("Sending request to {url}");

        let resp = self.client.get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        let body = resp.bytes().await?;
        log::debug!("Got {} bytes of data from {server}", body.len());
        Ok(body)
    }
}
