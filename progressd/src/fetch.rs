//! Retrieval of the "currently passing" manifest.
//!
//! The manifest is plain text with one test identifier per line.

use async_trait::async_trait;
use progress_common::TestIdentifierSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while fetching the manifest.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// A source of the passing-test set.
#[async_trait]
pub trait PassingSetSource: Send + Sync {
    async fn fetch_passing_identifiers(
        &self,
        manifest_url: &str,
    ) -> Result<TestIdentifierSet, FetchError>;
}

/// Split a manifest body into identifiers.
///
/// Blank lines (including the one after a trailing newline) are dropped and
/// a trailing `\r` is stripped from each line.
pub fn parse_manifest(body: &str) -> TestIdentifierSet {
    body.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .collect()
}

/// [`PassingSetSource`] that downloads the manifest over HTTP.
pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("progressd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    fn transport_error(url: &str, source: reqwest::Error) -> FetchError {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl PassingSetSource for HttpManifestFetcher {
    async fn fetch_passing_identifiers(
        &self,
        manifest_url: &str,
    ) -> Result<TestIdentifierSet, FetchError> {
        debug!(url = manifest_url, "Fetching passing manifest");

        let response = self
            .client
            .get(manifest_url)
            .send()
            .await
            .map_err(|e| Self::transport_error(manifest_url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: manifest_url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::transport_error(manifest_url, e))?;
        let identifiers = parse_manifest(&body);
        debug!(count = identifiers.len(), "Parsed passing manifest");
        Ok(identifiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn manifest_drops_trailing_newline_and_duplicates() {
        let ids = parse_manifest("a\nb\nb\nc\n");
        let expected: TestIdentifierSet = ["a", "b", "c"].into_iter().collect();
        assert_eq!(ids, expected);
        assert!(!ids.contains(""));
    }

    #[test]
    fn manifest_handles_crlf_and_blank_lines() {
        let ids = parse_manifest("first\r\n\r\nsecond\r\n\n");
        let expected: TestIdentifierSet = ["first", "second"].into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn empty_manifest_is_empty_set() {
        assert!(parse_manifest("").is_empty());
        assert!(parse_manifest("\n\n").is_empty());
    }

    #[tokio::test]
    async fn fetches_manifest_over_http() {
        let base = serve(Router::new().route("/testfile", get(|| async { "a\nb\nb\nc\n" }))).await;
        let fetcher = HttpManifestFetcher::new(Duration::from_secs(5)).unwrap();

        let ids = fetcher
            .fetch_passing_identifiers(&format!("{base}/testfile"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(Router::new().route(
            "/testfile",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        ))
        .await;
        let fetcher = HttpManifestFetcher::new(Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch_passing_identifiers(&format!("{base}/testfile"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let base = serve(Router::new().route(
            "/testfile",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let fetcher = HttpManifestFetcher::new(Duration::from_millis(100)).unwrap();

        let err = fetcher
            .fetch_passing_identifiers(&format!("{base}/testfile"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = HttpManifestFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch_passing_identifiers(&format!("http://{addr}/testfile"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }), "{err}");
    }
}
