//! Install, fetch, and activate reactions of the offline asset cache.
//!
//! The reactions are free functions over injected capabilities so they can be
//! driven by any host: the proxy server, the CLI, or a test with fake network
//! and storage. [`OfflineAssetCache`] bundles one configuration with its
//! capabilities and counts outcomes.

use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt, stream};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::http::{CacheKey, Request, Response};
use crate::network::{HttpNetwork, NetworkClient};
use crate::stats::{FetchStats, InstallReport, StatsSnapshot};
use crate::store::CacheStore;

/// Trait for receiving install progress updates.
///
/// All methods have default no-op implementations.
pub trait InstallProgress: Send + Sync {
    /// Called when an asset fetch starts.
    fn on_asset_start(&self, _url: &str) {}

    /// Called when an asset was fetched and is waiting for the batch commit.
    fn on_asset_fetched(&self, _url: &str, _bytes: u64) {}

    /// Called when an asset failed, which fails the whole install.
    fn on_asset_failed(&self, _url: &str, _error: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl InstallProgress for NoProgress {}

/// Where a fetch reaction got its answer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// The live network.
    Network,
    /// The current cache bucket, after the network failed.
    Cache,
}

impl ResponseSource {
    /// Returns a lowercase label, used for logs and response headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
        }
    }
}

/// Result of one fetch reaction.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The network attempt resolved. Any status code lands here.
    Network(Response),
    /// The network attempt failed and the current bucket had a match.
    Cache(Response),
    /// The network attempt failed and the current bucket had no match.
    Unavailable(Error),
}

impl FetchOutcome {
    /// Returns the response, if there is one.
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Network(resp) | Self::Cache(resp) => Some(resp),
            Self::Unavailable(_) => None,
        }
    }

    /// Consumes the outcome, returning the response if there is one.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Network(resp) | Self::Cache(resp) => Some(resp),
            Self::Unavailable(_) => None,
        }
    }

    /// Returns where the response came from, or `None` when unavailable.
    #[must_use]
    pub const fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Network(_) => Some(ResponseSource::Network),
            Self::Cache(_) => Some(ResponseSource::Cache),
            Self::Unavailable(_) => None,
        }
    }
}

/// Runs one network attempt, turning an elapsed deadline into a rejection.
async fn attempt<N>(network: &N, request: &Request, deadline: Option<Duration>) -> Result<Response>
where
    N: NetworkClient + ?Sized,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, network.fetch(request))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    url: request.url.to_string(),
                    timeout: limit,
                })
            }),
        None => network.fetch(request).await,
    }
}

/// Rejects responses the cache refuses to store.
fn check_cacheable(url: &str, response: &Response) -> Result<()> {
    // 206 is a success but only covers part of the resource.
    if !response.is_success() || response.status == 206 {
        return Err(Error::BadStatus {
            url: url.to_string(),
            status: response.status,
        });
    }
    Ok(())
}

/// Install reaction: opens the bucket, then fetches every configured asset
/// and stores them as one batch.
///
/// No entry is written unless every asset was fetched with a storable
/// response. The first failure aborts the remaining fetches.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for an unusable configuration such as a
/// repeated asset, the first asset failure ([`Error::Network`], [`Error::Timeout`],
/// [`Error::BadStatus`]) or the storage error that prevented the commit.
pub async fn on_install<N, S>(
    network: &N,
    store: &S,
    config: &CacheConfig,
    progress: &dyn InstallProgress,
) -> Result<InstallReport>
where
    N: NetworkClient + ?Sized,
    S: CacheStore + ?Sized,
{
    let start = Instant::now();
    config.validate()?;
    let urls = config.asset_urls()?;
    let deadline = config.network_timeout();

    // The bucket exists from here on, even if a fetch below fails.
    store.open(&config.cache_name).await?;
    log::info!("Opened cache {}", config.cache_name);

    let entries: Vec<(CacheKey, Response)> = stream::iter(urls)
        .map(|url| async move {
            let label = url.to_string();
            progress.on_asset_start(&label);
            let request = Request::get(url);
            let fetched = attempt(network, &request, deadline)
                .await
                .and_then(|resp| check_cacheable(&label, &resp).map(|()| resp));
            match fetched {
                Ok(resp) => {
                    progress.on_asset_fetched(&label, resp.body.len() as u64);
                    Ok((CacheKey::for_url(&request.url), resp))
                }
                Err(e) => {
                    progress.on_asset_failed(&label, &e.to_string());
                    Err(e)
                }
            }
        })
        .buffered(config.install_concurrency.max(1))
        .try_collect()
        .await?;

    let assets = entries.len();
    let total_bytes = entries.iter().map(|(_, r)| r.body.len() as u64).sum();
    store.put_all(&config.cache_name, entries).await?;

    Ok(InstallReport {
        cache_name: config.cache_name.clone(),
        assets,
        total_bytes,
        elapsed: start.elapsed(),
    })
}

/// Fetch reaction: network first, current bucket only when the network fails.
///
/// The cache is never written here. A storage error during the fallback
/// lookup is logged and treated as a miss.
pub async fn on_fetch<N, S>(
    request: &Request,
    network: &N,
    store: &S,
    config: &CacheConfig,
) -> FetchOutcome
where
    N: NetworkClient + ?Sized,
    S: CacheStore + ?Sized,
{
    let err = match attempt(network, request, config.network_timeout()).await {
        Ok(resp) => return FetchOutcome::Network(resp),
        Err(e) => e,
    };
    log::warn!("{} {} failed, trying cache: {err}", request.method, request.url);

    let Some(key) = CacheKey::for_request(request) else {
        return FetchOutcome::Unavailable(err);
    };
    match store.match_key(&config.cache_name, &key).await {
        Ok(Some(resp)) => FetchOutcome::Cache(resp),
        Ok(None) => FetchOutcome::Unavailable(err),
        Err(store_err) => {
            log::warn!("Cache lookup for {key} failed: {store_err}");
            FetchOutcome::Unavailable(err)
        }
    }
}

/// Activate reaction: applies the retention policy to buckets of other versions.
///
/// Returns the names of the deleted buckets. The current bucket is never deleted.
///
/// # Errors
///
/// Returns an error if the bucket list cannot be read or a deletion fails.
pub async fn on_activate<S>(store: &S, config: &CacheConfig) -> Result<Vec<String>>
where
    S: CacheStore + ?Sized,
{
    let mut deleted = Vec::new();
    for name in store.bucket_names().await? {
        if config.retention.should_delete(&name, &config.cache_name)
            && store.delete_bucket(&name).await?
        {
            log::info!("Deleted stale cache {name}");
            deleted.push(name);
        }
    }
    Ok(deleted)
}

/// One cache version bound to its network and storage capabilities.
pub struct OfflineAssetCache<N = HttpNetwork, S = Box<dyn CacheStore>> {
    config: CacheConfig,
    network: N,
    store: S,
    stats: FetchStats,
}

impl<N: NetworkClient, S: CacheStore> OfflineAssetCache<N, S> {
    /// Creates a cache from a validated configuration and its capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: CacheConfig, network: N, store: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            network,
            store,
            stats: FetchStats::new(),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cache storage.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the network client.
    #[must_use]
    pub const fn network(&self) -> &N {
        &self.network
    }

    /// Returns the current outcome counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs the install reaction.
    ///
    /// # Errors
    ///
    /// See [`on_install`].
    pub async fn install(&self, progress: &dyn InstallProgress) -> Result<InstallReport> {
        let result = on_install(&self.network, &self.store, &self.config, progress).await;
        self.stats.record_install(result.is_ok());
        match &result {
            Ok(report) => log::info!(
                "Installed {} assets ({} bytes) into {}",
                report.assets,
                report.total_bytes,
                report.cache_name
            ),
            Err(e) => log::error!("Install of {} failed: {e}", self.config.cache_name),
        }
        result
    }

    /// Runs the activate reaction.
    ///
    /// # Errors
    ///
    /// See [`on_activate`].
    pub async fn activate(&self) -> Result<Vec<String>> {
        on_activate(&self.store, &self.config).await
    }

    /// Runs the fetch reaction.
    pub async fn fetch(&self, request: &Request) -> FetchOutcome {
        let outcome = on_fetch(request, &self.network, &self.store, &self.config).await;
        match &outcome {
            FetchOutcome::Network(_) => self.stats.record_network(),
            FetchOutcome::Cache(_) => {
                log::info!("Served {} from cache {}", request.url, self.config.cache_name);
                self.stats.record_cache_fallback();
            }
            FetchOutcome::Unavailable(_) => self.stats.record_unavailable(),
        }
        outcome
    }
}
