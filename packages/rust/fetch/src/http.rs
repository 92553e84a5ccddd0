//! HTTP probe and fetch over a shared connection pool.
//!
//! Both calls follow redirects (up to `http.max_redirects`) and report the
//! terminal URL and status. A non-success terminal status is an error, so a
//! 404 and a refused connection both fail the liveness stage; the error kind
//! decides whether the runner retries.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use bookmarks_shared::{BookmarkError, HttpConfig, Result};

/// User-Agent string for liveness requests.
const USER_AGENT: &str = concat!("bookmarks/", env!("CARGO_PKG_VERSION"));

/// Result of a successful HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
}

/// Result of a successful GET or render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    /// Response body decoded as UTF-8 (lossy).
    pub content: String,
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Shared HTTP client for probe and fetch.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: u64,
}

impl HttpFetcher {
    /// Build the client from `[http]` config.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| BookmarkError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Lightweight reachability check (HEAD).
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResponse> {
        let target = parse_http_url(url)?;
        let response = self
            .client
            .head(target)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let response = ensure_success(url, response)?;
        let probe = ProbeResponse {
            final_url: response.url().to_string(),
            status: response.status().as_u16(),
        };
        debug!(final_url = %probe.final_url, status = probe.status, "probe ok");
        Ok(probe)
    }

    /// Full page fetch (GET), bounded by `max_body_bytes`.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<PageResponse> {
        let target = parse_http_url(url)?;
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let mut response = ensure_success(url, response)?;
        let final_url = response.url().to_string();
        let status = response.status().as_u16();

        if let Some(len) = response.content_length() {
            if len > self.max_body_bytes {
                return Err(body_too_large(url, self.max_body_bytes));
            }
        }

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BookmarkError::Network(format!("{url}: body read failed: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(body_too_large(url, self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        let content = String::from_utf8_lossy(&body).into_owned();
        debug!(%final_url, status, content_len = content.len(), "fetch ok");
        Ok(PageResponse {
            final_url,
            status,
            content,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject URLs the client should never be handed.
fn parse_http_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| BookmarkError::validation(format!("invalid URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(BookmarkError::validation(format!(
            "unsupported URL scheme {other:?} in {url}"
        ))),
    }
}

fn ensure_success(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BookmarkError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn body_too_large(url: &str, limit: u64) -> BookmarkError {
    BookmarkError::validation(format!("{url}: body exceeds {limit} bytes"))
}

/// Classify transport errors: timeouts and connection failures stay retryable,
/// redirect loops and request-construction errors do not.
fn map_reqwest_error(url: &str, e: reqwest::Error) -> BookmarkError {
    if e.is_redirect() {
        BookmarkError::validation(format!("{url}: too many redirects"))
    } else if e.is_builder() {
        BookmarkError::validation(format!("{url}: {e}"))
    } else if e.is_timeout() {
        BookmarkError::Network(format!("{url}: timed out: {e}"))
    } else {
        BookmarkError::Network(format!("{url}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&HttpConfig::default()).expect("build fetcher")
    }

    #[tokio::test]
    async fn probe_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = format!("{}/ok", server.uri());
        let probe = fetcher().probe(&url).await.expect("probe");
        assert_eq!(probe.status, 200);
        assert_eq!(probe.final_url, url);
    }

    #[tokio::test]
    async fn probe_follows_redirects() {
        let server = MockServer::start().await;
        let target = format!("{}/new", server.uri());
        Mock::given(method("HEAD"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", target.as_str()))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = fetcher()
            .probe(&format!("{}/old", server.uri()))
            .await
            .expect("probe");
        assert_eq!(probe.final_url, target);
    }

    #[tokio::test]
    async fn not_found_is_structural() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher()
            .probe(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, BookmarkError::HttpStatus { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch(&format!("{}/flaky", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>hello</body></html>"),
            )
            .mount(&server)
            .await;

        let page = fetcher()
            .fetch(&format!("{}/page", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(page.status, 200);
        assert!(page.content.contains("hello"));
    }

    #[tokio::test]
    async fn fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&server)
            .await;

        let config = HttpConfig {
            max_body_bytes: 1024,
            ..HttpConfig::default()
        };
        let err = HttpFetcher::new(&config)
            .unwrap()
            .fetch(&format!("{}/big", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds 1024 bytes"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Bind and drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = fetcher()
            .probe(&format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap_err();
        assert!(matches!(err, BookmarkError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_urls_are_structural() {
        let f = fetcher();
        for url in ["not a url", "ftp://example.com/file", "mailto:a@b.test"] {
            let err = f.probe(url).await.unwrap_err();
            assert!(matches!(err, BookmarkError::Validation { .. }), "{url}");
            assert!(!err.is_transient());
        }
    }
}
