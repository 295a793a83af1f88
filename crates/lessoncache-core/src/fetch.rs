//! Network access.
//!
//! The proxy talks to the network only through the `Fetcher` trait, so the
//! host can plug in its own transport and tests can script one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::http::{Request, Response};

/// Outer bound on any single HTTP exchange, in seconds.
/// Strategies apply their own tighter deadlines on top.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. Any HTTP response, whatever its status, is `Ok`.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Run a fetch under a deadline. Expiry is a network failure like any other.
pub async fn fetch_with_timeout(
    fetcher: &dyn Fetcher,
    request: &Request,
    deadline: Duration,
) -> Result<Response, FetchError> {
    match tokio::time::timeout(deadline, fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(url = %request.url, deadline_ms = deadline.as_millis() as u64, "Fetch timed out");
            Err(FetchError::Timeout(deadline))
        }
    }
}

/// Fetcher backed by `reqwest`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!(header = %name, "Dropping invalid request header"),
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!(url = %request.url, status = status, bytes = body.len(), "Fetched from network");
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
