use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}

/// A fetch could not complete at the network layer.
///
/// An HTTP response with any status is *not* a `FetchError`; only the
/// absence of a response is.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid generation id: {0:?}")]
    InvalidGeneration(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure of the critical pre-warm. The generation must not become current.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to fetch critical resource {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Critical resource {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to write critical resources: {0}")]
    Store(#[from] StoreError),

    #[error("Generation {0} has not been installed")]
    NotInstalled(String),
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Endpoint rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("No delivery endpoint configured")]
    NotConfigured,
}

impl DeliveryError {
    pub fn from_status(status: u16, body: &str) -> Self {
        DeliveryError::Rejected {
            status,
            body: truncate_body(body),
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Could not determine {0} directory")]
    NoDirectory(&'static str),
}
