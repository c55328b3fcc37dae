//! offline-cache - network-first HTTP fetching with a versioned offline cache.
//!
//! A cache version pre-stores a fixed list of static assets when it is
//! installed. Every later fetch goes to the network first; the stored copy
//! is only used when the network attempt fails outright. Any HTTP status,
//! including errors, counts as a network answer.
//!
//! # Example
//!
//! ```no_run
//! use offline_cache::{CacheConfig, HttpNetwork, MemoryStore, NoProgress, OfflineAssetCache, Request};
//!
//! # async fn example() -> offline_cache::Result<()> {
//! let cache = OfflineAssetCache::new(CacheConfig::default(), HttpNetwork::new()?, MemoryStore::new())?;
//!
//! // Pre-cache the asset list, all or nothing
//! let report = cache.install(&NoProgress).await?;
//! println!("Stored {} assets in {}", report.assets, report.cache_name);
//!
//! // Network first, cache on transport failure
//! let outcome = cache.fetch(&Request::parse("http://127.0.0.1:8000/static/manifest.json")?).await;
//! if let Some(source) = outcome.source() {
//!     println!("answered from {}", source.as_str());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod disk;
pub mod error;
pub mod http;
pub mod network;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export main types for convenience
pub use config::{AppConfig, CacheConfig, RetentionPolicy, ServerConfig, StorageBackend, StorageConfig};
pub use disk::DiskStore;
pub use error::{Error, Result};
pub use http::{CacheKey, Request, Response};
pub use network::{HttpNetwork, NetworkClient};
pub use stats::{FetchStats, InstallReport, StatsSnapshot};
pub use store::{CacheStore, MemoryStore, open_store};
pub use worker::{
    FetchOutcome, InstallProgress, NoProgress, OfflineAssetCache, ResponseSource, on_activate,
    on_fetch, on_install,
};

// Re-export the URL type used in the public API
pub use reqwest::Url;
