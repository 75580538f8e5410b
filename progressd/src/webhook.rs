//! Authenticated push webhooks that trigger refreshes.
//!
//! Each configured source has its own secret and is bound to one test set.
//! Deliveries are verified against `X-Hub-Signature-256` before anything else
//! is looked at.

use crate::reconcile::Reconciler;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use progress_common::{TestSet, WebhookSourceConfig};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Reasons a delivery is rejected.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown webhook source: {0}")]
    UnknownSource(String),

    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("missing event header")]
    MissingEvent,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl WebhookError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSource(_) => StatusCode::NOT_FOUND,
            Self::MissingSignature | Self::InvalidSignatureFormat(_) | Self::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            Self::MissingEvent | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        // Generic bodies only; details stay in the log.
        let body = match &self {
            Self::UnknownSource(_) => "Not Found",
            Self::MissingSignature => "Missing signature",
            Self::InvalidSignatureFormat(_) => "Invalid signature format",
            Self::InvalidSignature => "Invalid signature",
            Self::MissingEvent => "Missing event type",
            Self::InvalidPayload(_) => "Invalid payload",
        };
        (self.status_code(), body).into_response()
    }
}

/// What an accepted delivery led to.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A push; the refresh runs in the background, or is folded into one
    /// already waiting to start.
    RefreshScheduled { set: TestSet, task: JoinHandle<()> },
    /// Any event other than a push.
    Ignored { event: String },
}

impl DispatchOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RefreshScheduled { .. } => StatusCode::ACCEPTED,
            Self::Ignored { .. } => StatusCode::OK,
        }
    }
}

impl IntoResponse for DispatchOutcome {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::RefreshScheduled { .. } => "Accepted",
            Self::Ignored { .. } => "OK",
        };
        (self.status_code(), body).into_response()
    }
}

/// Check `header` (`sha256=<hex>`) against the HMAC-SHA256 of `body`.
///
/// The comparison is constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;
    let hex_digest = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(WebhookError::InvalidSignatureFormat("expected sha256= prefix"))?;
    let expected = hex::decode(hex_digest)
        .map_err(|_| WebhookError::InvalidSignatureFormat("digest is not hex"))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| WebhookError::InvalidSignatureFormat("unusable secret"))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Compute the header value a sender would attach to `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Routes verified push events to the refresh bound to their source.
#[derive(Clone)]
pub struct WebhookDispatcher {
    sources: Arc<Vec<WebhookSourceConfig>>,
    reconciler: Arc<Reconciler>,
}

impl WebhookDispatcher {
    pub fn new(sources: Vec<WebhookSourceConfig>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            sources: Arc::new(sources),
            reconciler,
        }
    }

    pub fn sources(&self) -> &[WebhookSourceConfig] {
        &self.sources
    }

    /// Verify and act on one delivery from `source`.
    pub fn handle(
        &self,
        source: &str,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<DispatchOutcome, WebhookError> {
        let config = self
            .sources
            .iter()
            .find(|s| s.name == source)
            .ok_or_else(|| WebhookError::UnknownSource(source.to_string()))?;

        let signature = match headers.get(SIGNATURE_HEADER).map(|v| v.to_str()) {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => {
                warn!(source, "Rejected webhook: signature header is not ASCII");
                return Err(WebhookError::InvalidSignatureFormat("header is not ASCII"));
            }
        };
        if let Err(e) = verify_signature(config.secret.as_bytes(), payload, signature) {
            warn!(source, error = %e, "Rejected webhook");
            return Err(e);
        }

        let event = headers
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(WebhookError::MissingEvent)?;
        if event != "push" {
            debug!(source, event, "Ignoring webhook event");
            return Ok(DispatchOutcome::Ignored {
                event: event.to_string(),
            });
        }

        let push: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let Some(push) = push.as_object() else {
            return Err(WebhookError::InvalidPayload(
                "push payload is not a JSON object".to_string(),
            ));
        };
        info!(
            source,
            git_ref = push.get("ref").and_then(|v| v.as_str()).unwrap_or("-"),
            after = push.get("after").and_then(|v| v.as_str()).unwrap_or("-"),
            kind = %config.refresh,
            "Push received, scheduling refresh"
        );

        let set = config.refresh;
        let reconciler = self.reconciler.clone();
        let source = source.to_string();
        let task = tokio::spawn(async move {
            match reconciler.refresh_coalesced(set).await {
                Some(Err(e)) => {
                    warn!(source = %source, kind = %set, error = %e, "Webhook-triggered refresh failed");
                }
                Some(Ok(_)) => {}
                None => debug!(source = %source, kind = %set, "Push folded into queued refresh"),
            }
        });
        Ok(DispatchOutcome::RefreshScheduled { set, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProgressMetrics;
    use crate::reconcile::ReconcilerSettings;
    use crate::store::SnapshotStore;
    use crate::testing::{FakeMirror, StaticFetcher, suite_file};
    use axum::http::HeaderValue;

    const SERVER_SECRET: &str = "server-secret";
    const SUITE_SECRET: &str = "suite-secret";

    fn dispatcher(dir: &std::path::Path) -> (WebhookDispatcher, Arc<Reconciler>) {
        let store = SnapshotStore::open(&dir.join("stats.db")).unwrap();
        let checkout_dir = dir.join("sytest");
        let reconciler = Arc::new(Reconciler::new(
            store,
            Arc::new(FakeMirror::new(vec![suite_file("tests/t.pl", &["a", "b", "c"])])),
            Arc::new(StaticFetcher::new(["a", "b"])),
            Arc::new(ProgressMetrics::new().unwrap()),
            ReconcilerSettings {
                manifest_url: "http://example.invalid/testfile".to_string(),
                repository_url: "https://example.invalid/sytest".to_string(),
                tests_dir: checkout_dir.join("tests"),
                checkout_dir,
            },
        ));
        let sources = vec![
            WebhookSourceConfig {
                name: "server".to_string(),
                secret: SERVER_SECRET.to_string(),
                refresh: TestSet::Passing,
            },
            WebhookSourceConfig {
                name: "testsuite".to_string(),
                secret: SUITE_SECRET.to_string(),
                refresh: TestSet::Total,
            },
        ];
        (WebhookDispatcher::new(sources, reconciler.clone()), reconciler)
    }

    fn headers(event: &str, signature: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        if let Some(signature) = signature {
            headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        }
        headers
    }

    const PUSH: &[u8] = br#"{"ref":"refs/heads/develop","after":"0123abcd"}"#;

    #[test]
    fn signature_round_trip() {
        let header = sign(b"key", b"body");
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(b"key", b"body", Some(&header)).is_ok());
        assert!(matches!(
            verify_signature(b"other", b"body", Some(&header)),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(b"key", b"tampered", Some(&header)),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert!(matches!(
            verify_signature(b"key", b"body", None),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature(b"key", b"body", Some("sha1=abcd")),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
        assert!(matches!(
            verify_signature(b"key", b"body", Some("sha256=not-hex")),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
        // Truncated digest.
        assert!(matches!(
            verify_signature(b"key", b"body", Some("sha256=abcd")),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            WebhookError::InvalidSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            WebhookError::MissingSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            WebhookError::UnknownSource("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WebhookError::InvalidPayload("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn error_body_does_not_leak_details() {
        let response = WebhookError::InvalidPayload("expected value at line 1".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Invalid payload");
    }

    #[tokio::test]
    async fn invalid_signature_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, reconciler) = dispatcher(dir.path());

        let bad = sign(b"wrong", PUSH);
        let err = dispatcher
            .handle("testsuite", PUSH, &headers("push", Some(&bad)))
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));

        let err = dispatcher
            .handle("server", PUSH, &headers("push", None))
            .unwrap_err();
        assert!(matches!(err, WebhookError::MissingSignature));

        let counts = reconciler.store().counts().unwrap();
        assert_eq!((counts.total, counts.passing), (0, 0));
    }

    #[tokio::test]
    async fn testsuite_push_refreshes_only_total() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, reconciler) = dispatcher(dir.path());

        let signature = sign(SUITE_SECRET.as_bytes(), PUSH);
        let outcome = dispatcher
            .handle("testsuite", PUSH, &headers("push", Some(&signature)))
            .unwrap();
        assert_eq!(outcome.status_code(), StatusCode::ACCEPTED);
        let DispatchOutcome::RefreshScheduled { set, task } = outcome else {
            panic!("expected a scheduled refresh");
        };
        assert_eq!(set, TestSet::Total);
        task.await.unwrap();

        let counts = reconciler.store().counts().unwrap();
        assert_eq!((counts.total, counts.passing), (3, 0));
    }

    #[tokio::test]
    async fn server_push_refreshes_only_passing() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, reconciler) = dispatcher(dir.path());

        let signature = sign(SERVER_SECRET.as_bytes(), PUSH);
        let outcome = dispatcher
            .handle("server", PUSH, &headers("push", Some(&signature)))
            .unwrap();
        let DispatchOutcome::RefreshScheduled { task, .. } = outcome else {
            panic!("expected a scheduled refresh");
        };
        task.await.unwrap();

        let counts = reconciler.store().counts().unwrap();
        assert_eq!((counts.total, counts.passing), (0, 2));
    }

    #[tokio::test]
    async fn secrets_are_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path());

        let signature = sign(SERVER_SECRET.as_bytes(), PUSH);
        let err = dispatcher
            .handle("testsuite", PUSH, &headers("push", Some(&signature)))
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
    }

    #[tokio::test]
    async fn ping_is_accepted_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, reconciler) = dispatcher(dir.path());

        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let signature = sign(SERVER_SECRET.as_bytes(), body);
        let outcome = dispatcher
            .handle("server", body, &headers("ping", Some(&signature)))
            .unwrap();
        assert_eq!(outcome.status_code(), StatusCode::OK);
        assert!(matches!(outcome, DispatchOutcome::Ignored { ref event } if event == "ping"));
        assert!(reconciler.last_success(TestSet::Passing).is_none());
    }

    #[tokio::test]
    async fn push_payload_must_be_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path());

        for body in [&b"[1, 2]"[..], b"not json"] {
            let signature = sign(SERVER_SECRET.as_bytes(), body);
            let err = dispatcher
                .handle("server", body, &headers("push", Some(&signature)))
                .unwrap_err();
            assert!(matches!(err, WebhookError::InvalidPayload(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn unknown_source_and_missing_event() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path());

        let err = dispatcher
            .handle("nobody", PUSH, &headers("push", None))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let mut no_event = HeaderMap::new();
        let signature = sign(SERVER_SECRET.as_bytes(), PUSH);
        no_event.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        let err = dispatcher.handle("server", PUSH, &no_event).unwrap_err();
        assert!(matches!(err, WebhookError::MissingEvent));
    }
}
