//! Reverse proxy that runs every request through the fetch reaction.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request as IncomingRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as OutgoingResponse};
use axum::routing::get;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::{NetworkClient, decode_header_value, encode_header_value, is_hop_by_hop};
use crate::store::CacheStore;
use crate::worker::{FetchOutcome, NoProgress, OfflineAssetCache, ResponseSource};

/// Reserved path reporting outcome counters. Never forwarded upstream.
pub const HEALTH_PATH: &str = "/__offline-cache/health";

/// Response header naming where the answer came from.
pub const SOURCE_HEADER: &str = "x-offline-cache";

/// Largest request body the proxy buffers.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

struct ProxyState<N, S> {
    cache: Arc<OfflineAssetCache<N, S>>,
    upstream: Url,
}

impl<N, S> Clone for ProxyState<N, S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            upstream: self.upstream.clone(),
        }
    }
}

async fn health<N, S>(State(state): State<ProxyState<N, S>>) -> impl IntoResponse
where
    N: NetworkClient + 'static,
    S: CacheStore + 'static,
{
    axum::Json(state.cache.stats())
}

/// Converts an incoming request into one addressed to the upstream origin.
async fn to_upstream(
    upstream: &Url,
    incoming: IncomingRequest,
) -> std::result::Result<Request, OutgoingResponse> {
    let (parts, body) = incoming.into_parts();
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = upstream
        .join(path)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("bad request path: {e}")).into_response())?;
    // Scheme-relative paths like `//host/x` would leave the upstream origin.
    if url.origin() != upstream.origin() {
        return Err((StatusCode::BAD_REQUEST, "request leaves the upstream origin").into_response());
    }
    let body = to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE.into_response())?;
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "host")
        .map(|(name, value)| (name.as_str().to_string(), decode_header_value(value)))
        .collect();
    Ok(Request {
        method: parts.method,
        url,
        headers,
        body,
    })
}

/// Relays a network or cached response to the client.
fn to_client(response: Response, source: ResponseSource) -> OutgoingResponse {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match encode_header_value(value) {
            Some(value) => builder = builder.header(name.as_str(), value),
            None => log::debug!("Dropping unencodable response header {name}"),
        }
    }
    builder
        .header(SOURCE_HEADER, source.as_str())
        .body(Body::from(response.body))
        .unwrap_or_else(|e| {
            log::error!("Cannot relay response: {e}");
            (StatusCode::BAD_GATEWAY, "invalid upstream response").into_response()
        })
}

async fn proxy<N, S>(
    State(state): State<ProxyState<N, S>>,
    incoming: IncomingRequest,
) -> OutgoingResponse
where
    N: NetworkClient + 'static,
    S: CacheStore + 'static,
{
    let request = match to_upstream(&state.upstream, incoming).await {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    match state.cache.fetch(&request).await {
        FetchOutcome::Network(resp) => to_client(resp, ResponseSource::Network),
        FetchOutcome::Cache(resp) => to_client(resp, ResponseSource::Cache),
        FetchOutcome::Unavailable(e) => {
            (StatusCode::BAD_GATEWAY, format!("offline and not cached: {e}")).into_response()
        }
    }
}

/// Builds the proxy router for a cache and an upstream origin.
pub fn router<N, S>(cache: Arc<OfflineAssetCache<N, S>>, upstream: Url) -> Router
where
    N: NetworkClient + 'static,
    S: CacheStore + 'static,
{
    let state = ProxyState { cache, upstream };
    Router::new()
        .route(HEALTH_PATH, get(health::<N, S>))
        .fallback(proxy::<N, S>)
        .with_state(state)
}

/// Installs the current version, activates it, and serves until `shutdown` fires.
///
/// A failed install is logged and the proxy keeps serving network-first;
/// fallbacks then miss until a later install succeeds.
///
/// # Errors
///
/// Returns an error if the upstream URL is invalid or the listener cannot bind.
pub async fn run<N, S>(
    cache: Arc<OfflineAssetCache<N, S>>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    N: NetworkClient + 'static,
    S: CacheStore + 'static,
{
    let upstream = config.upstream_url()?;

    match cache.install(&NoProgress).await {
        Ok(_) => match cache.activate().await {
            Ok(deleted) if !deleted.is_empty() => {
                log::info!("Removed {} stale cache(s)", deleted.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Activation failed: {e}"),
        },
        Err(e) => log::warn!("Serving without a populated cache: {e}"),
    }

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;
    log::info!("Proxying http://{addr} -> {upstream}");

    let app = router(cache, upstream);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Error::Io)?;

    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::http::CacheKey;
    use crate::stats::StatsSnapshot;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ORIGIN: &str = "http://127.0.0.1:8000/";

    #[derive(Default)]
    struct SwitchableNetwork {
        routes: Mutex<HashMap<String, Response>>,
        offline: AtomicBool,
        seen: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl NetworkClient for SwitchableNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            self.seen.lock().unwrap().push(request.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Network {
                    url: request.url.to_string(),
                    reason: "network unreachable".to_string(),
                });
            }
            Ok(self
                .routes
                .lock()
                .unwrap()
                .get(request.url.as_str())
                .cloned()
                .unwrap_or_else(|| Response::new(404, "not found")))
        }
    }

    type TestCache = OfflineAssetCache<Arc<SwitchableNetwork>, MemoryStore>;

    async fn start_proxy() -> (SocketAddr, Arc<SwitchableNetwork>, Arc<TestCache>) {
        let net = Arc::new(SwitchableNetwork::default());
        {
            let mut routes = net.routes.lock().unwrap();
            routes.insert(
                format!("{ORIGIN}static/manifest.json"),
                Response::new(200, "{\"name\":\"School Guard\"}")
                    .with_header("content-type", "application/manifest+json"),
            );
            routes.insert(
                format!("{ORIGIN}static/icons/icon-192x192.png"),
                Response::new(200, "png-192"),
            );
            routes.insert(
                format!("{ORIGIN}static/icons/icon-512x512.png"),
                Response::new(200, "png-512"),
            );
        }
        let cache = Arc::new(
            OfflineAssetCache::new(
                CacheConfig::new().with_origin(ORIGIN),
                Arc::clone(&net),
                MemoryStore::new(),
            )
            .unwrap(),
        );
        cache.install(&NoProgress).await.unwrap();

        let app = router(Arc::clone(&cache), Url::parse(ORIGIN).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, net, cache)
    }

    #[tokio::test]
    async fn online_requests_are_relayed_from_network() {
        let (addr, _net, _cache) = start_proxy().await;
        let resp = reqwest::get(format!("http://{addr}/static/manifest.json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[SOURCE_HEADER], "network");
        assert_eq!(
            resp.headers()["content-type"],
            "application/manifest+json"
        );
        assert_eq!(resp.text().await.unwrap(), "{\"name\":\"School Guard\"}");
    }

    #[tokio::test]
    async fn upstream_errors_are_relayed_unchanged() {
        let (addr, _net, _cache) = start_proxy().await;
        let resp = reqwest::get(format!("http://{addr}/dashboard")).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()[SOURCE_HEADER], "network");
    }

    #[tokio::test]
    async fn offline_requests_fall_back_to_cache() {
        let (addr, net, _cache) = start_proxy().await;
        net.offline.store(true, Ordering::SeqCst);

        let resp = reqwest::get(format!("http://{addr}/static/icons/icon-192x192.png"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[SOURCE_HEADER], "cache");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"png-192");
    }

    #[tokio::test]
    async fn offline_uncached_request_is_bad_gateway() {
        let (addr, net, _cache) = start_proxy().await;
        net.offline.store(true, Ordering::SeqCst);

        let resp = reqwest::get(format!("http://{addr}/dashboard")).await.unwrap();
        assert_eq!(resp.status(), 502);
        assert!(resp.headers().get(SOURCE_HEADER).is_none());
    }

    #[tokio::test]
    async fn request_is_forwarded_with_method_query_and_body() {
        let (addr, net, _cache) = start_proxy().await;
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/api/scan?door=3"))
            .header("x-card", "1234")
            .body("payload")
            .send()
            .await
            .unwrap();

        let seen = net.seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(seen.method, reqwest::Method::POST);
        assert_eq!(seen.url.as_str(), format!("{ORIGIN}api/scan?door=3"));
        assert_eq!(&seen.body[..], b"payload");
        assert!(seen.headers.iter().any(|(k, v)| k == "x-card" && v == "1234"));
        assert!(!seen.headers.iter().any(|(k, _)| k == "host"));
    }

    #[test]
    fn relayed_headers_keep_their_bytes() {
        let cached = Response::new(200, "ok").with_header("x-legacy", "caf\u{e9}");
        let relayed = to_client(cached, ResponseSource::Cache);
        assert_eq!(relayed.headers()["x-legacy"].as_bytes(), b"caf\xe9");
        assert_eq!(relayed.headers()[SOURCE_HEADER], "cache");
    }

    #[tokio::test]
    async fn incoming_non_utf8_header_is_forwarded() {
        let upstream = Url::parse(ORIGIN).unwrap();
        let incoming = axum::http::Request::builder()
            .uri("/static/manifest.json")
            .header("x-legacy", axum::http::HeaderValue::from_bytes(b"caf\xe9").unwrap())
            .body(Body::empty())
            .unwrap();
        let request = to_upstream(&upstream, incoming).await.unwrap();
        let (_, value) = request
            .headers
            .iter()
            .find(|(name, _)| name == "x-legacy")
            .unwrap();
        assert_eq!(value, "caf\u{e9}");
    }

    #[tokio::test]
    async fn scheme_relative_path_is_rejected() {
        let upstream = Url::parse(ORIGIN).unwrap();
        let incoming = axum::http::Request::builder()
            .uri("//evil.example/steal")
            .body(Body::empty())
            .unwrap();
        let rejection = to_upstream(&upstream, incoming).await.unwrap_err();
        assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_stats_without_forwarding() {
        let (addr, net, cache) = start_proxy().await;
        let before = net.seen.lock().unwrap().len();

        let body = reqwest::get(format!("http://{addr}{HEALTH_PATH}"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["installs_succeeded"], 1);
        assert_eq!(net.seen.lock().unwrap().len(), before);
        assert_eq!(cache.stats(), StatsSnapshot {
            installs_succeeded: 1,
            ..StatsSnapshot::default()
        });
    }

    #[tokio::test]
    async fn proxy_never_writes_to_cache() {
        let (addr, _net, cache) = start_proxy().await;
        reqwest::get(format!("http://{addr}/dashboard")).await.unwrap();
        let keys = cache.store().keys("school-guard-v5").await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&CacheKey::for_url(
            &Url::parse(&format!("{ORIGIN}dashboard")).unwrap()
        )));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let net = Arc::new(SwitchableNetwork::default());
        net.offline.store(true, Ordering::SeqCst);
        let cache = Arc::new(
            OfflineAssetCache::new(CacheConfig::new(), Arc::clone(&net), MemoryStore::new())
                .unwrap(),
        );
        let mut config = AppConfig::default();
        config.server.port = 0;

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let cache = Arc::clone(&cache);
            let token = token.clone();
            async move { run(cache, &config, token).await }
        });
        token.cancel();
        handle.await.unwrap().unwrap();
        // Offline install failed but the server still started and stopped cleanly.
        assert_eq!(cache.stats().installs_failed, 1);
    }
}
