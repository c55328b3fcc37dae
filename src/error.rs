//! Error types for the offline-cache library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while installing assets or answering requests.
#[derive(Error, Debug)]
pub enum Error {
    /// The network attempt was rejected before any response arrived.
    #[error("network request to {url} failed: {reason}")]
    Network {
        /// URL that was being fetched.
        url: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// The network attempt did not settle before the configured deadline.
    #[error("network request to {url} timed out after {timeout:?}")]
    Timeout {
        /// URL that was being fetched.
        url: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// An asset could not be stored because the response was not cacheable.
    #[error("asset {url} returned unusable status {status}")]
    BadStatus {
        /// URL of the rejected asset.
        url: String,
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// A URL or asset path could not be parsed or resolved.
    #[error("invalid URL {input}: {reason}")]
    InvalidUrl {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// I/O error in the on-disk cache storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML.
    #[error("config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    /// Configuration parsed but holds values the cache cannot work with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cache storage reported an inconsistency.
    #[error("cache storage error: {0}")]
    Storage(String),

    /// Entry metadata could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// HTTP client error outside of a fetch attempt (e.g. client construction).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true if this error is a rejected or timed-out network attempt.
    ///
    /// These are the failures the fetch reaction recovers from by consulting
    /// the cache.
    #[must_use]
    pub const fn is_network_failure(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

/// A specialized `Result` type for offline-cache operations.
pub type Result<T> = std::result::Result<T, Error>;
