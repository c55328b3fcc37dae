//! Network transport abstraction for testability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;

use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Performs the real network attempt for a request.
///
/// A response with any status code is `Ok`. Only transport-level failures
/// (refused connection, DNS, TLS, reset) are `Err`.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Sends the request and reads the full response.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<T: NetworkClient + ?Sized> NetworkClient for Arc<T> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        (**self).fetch(request).await
    }
}

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns true if a header belongs to one hop and must not be forwarded.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Decodes a header value one byte per char, so any byte sequence survives.
#[must_use]
pub fn decode_header_value(value: &HeaderValue) -> String {
    value.as_bytes().iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`decode_header_value`]. Text with chars above U+00FF is sent
/// as UTF-8. Returns `None` for values HTTP cannot carry, such as newlines.
#[must_use]
pub fn encode_header_value(text: &str) -> Option<HeaderValue> {
    let bytes: Option<Vec<u8>> = text.chars().map(|c| u8::try_from(c).ok()).collect();
    match bytes {
        Some(latin1) => HeaderValue::from_bytes(&latin1).ok(),
        None => HeaderValue::from_bytes(text.as_bytes()).ok(),
    }
}

/// Builds the HTTP client used for network attempts.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("offline-cache/", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}

/// Default network client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Creates a client with the default pool settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    /// Wraps an existing `reqwest` client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NetworkClient for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        let transport = |e: reqwest::Error| Error::Network {
            url: url.clone(),
            reason: e.to_string(),
        };

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            match encode_header_value(value) {
                Some(value) => builder = builder.header(name.as_str(), value),
                None => log::debug!("Dropping unencodable request header {name}"),
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = builder.send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| (name.as_str().to_string(), decode_header_value(value)))
            .collect();
        // A body cut off mid-stream is a transport failure too.
        let body = resp.bytes().await.map_err(transport)?;

        log::debug!("{} {url} -> {status}", request.method);
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("etag"));
    }

    #[test]
    fn non_utf8_header_bytes_survive_decoding() {
        let raw = HeaderValue::from_bytes(b"caf\xe9; q=1").unwrap();
        let text = decode_header_value(&raw);
        assert_eq!(text, "caf\u{e9}; q=1");
        assert_eq!(encode_header_value(&text).unwrap().as_bytes(), raw.as_bytes());
    }

    #[test]
    fn header_encoding_edge_cases() {
        assert_eq!(encode_header_value("text/html").unwrap(), "text/html");
        // Chars beyond one byte fall back to their UTF-8 bytes.
        assert_eq!(
            encode_header_value("\u{2713} ok").unwrap().as_bytes(),
            "\u{2713} ok".as_bytes()
        );
        assert!(encode_header_value("split\r\nx-injected: 1").is_none());
    }

    #[test]
    fn http_network_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpNetwork>();
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        // Bind then drop to obtain a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let net = HttpNetwork::new().unwrap();
        let req = Request::parse(&format!("http://127.0.0.1:{port}/static/manifest.json")).unwrap();
        let err = net.fetch(&req).await.unwrap_err();
        assert!(err.is_network_failure(), "unexpected error: {err}");
    }

    #[cfg(feature = "server")]
    mod loopback {
        use super::*;
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;

        async fn spawn_origin() -> String {
            let app = Router::new()
                .route(
                    "/static/manifest.json",
                    get(|| async { ([("content-type", "application/json")], "{\"name\":\"guard\"}") }),
                )
                .route(
                    "/legacy",
                    get(|| async {
                        let mut headers = axum::http::HeaderMap::new();
                        headers.insert(
                            "x-legacy",
                            HeaderValue::from_bytes(b"caf\xe9").unwrap(),
                        );
                        (headers, "ok")
                    }),
                )
                .route(
                    "/broken",
                    get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
                );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }

        #[tokio::test]
        async fn fetch_returns_body_and_headers() {
            let origin = spawn_origin().await;
            let net = HttpNetwork::new().unwrap();
            let req = Request::parse(&format!("{origin}/static/manifest.json")).unwrap();
            let resp = net.fetch(&req).await.unwrap();
            assert_eq!(resp.status, 200);
            assert_eq!(resp.header("content-type"), Some("application/json"));
            assert_eq!(&resp.body[..], b"{\"name\":\"guard\"}");
        }

        #[tokio::test]
        async fn non_utf8_header_is_kept() {
            let origin = spawn_origin().await;
            let net = HttpNetwork::new().unwrap();
            let resp = net
                .fetch(&Request::parse(&format!("{origin}/legacy")).unwrap())
                .await
                .unwrap();
            let value = resp.header("x-legacy").unwrap();
            assert_eq!(encode_header_value(value).unwrap().as_bytes(), b"caf\xe9");
        }

        #[tokio::test]
        async fn error_status_still_resolves() {
            let origin = spawn_origin().await;
            let net = HttpNetwork::new().unwrap();

            let resp = net
                .fetch(&Request::parse(&format!("{origin}/broken")).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status, 500);

            let resp = net
                .fetch(&Request::parse(&format!("{origin}/missing")).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status, 404);
        }
    }
}
