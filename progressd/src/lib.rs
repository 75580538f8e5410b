//! Test progress daemon.
//!
//! Keeps two sets of test names in SQLite (every test declared in the
//! test-suite repository, and every test the server currently passes),
//! refreshes them on webhook pushes and on a timer, and serves the counts.

#![forbid(unsafe_code)]

pub mod extract;
pub mod fetch;
pub mod http_api;
pub mod metrics;
pub mod mirror;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod webhook;

use anyhow::Context;
use progress_common::ProgressConfig;
use std::sync::Arc;
use std::time::Instant;

use fetch::{HttpManifestFetcher, PassingSetSource};
use http_api::HttpState;
use metrics::ProgressMetrics;
use mirror::{GitCliMirror, RepositoryMirror};
use reconcile::{Reconciler, ReconcilerSettings};
use store::SnapshotStore;
use webhook::WebhookDispatcher;

/// Shared daemon context, built once at startup.
#[derive(Clone)]
pub struct DaemonContext {
    pub config: Arc<ProgressConfig>,
    pub metrics: ProgressMetrics,
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: WebhookDispatcher,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon version.
    pub version: &'static str,
}

impl DaemonContext {
    /// Build the context with the `git` mirror and HTTP manifest fetcher.
    pub fn build(config: ProgressConfig) -> anyhow::Result<Self> {
        let mirror = Arc::new(GitCliMirror::new(config.git.timeout()));
        let fetcher = Arc::new(
            HttpManifestFetcher::new(config.fetch.timeout())
                .context("Failed to create manifest fetcher")?,
        );
        Self::with_sources(config, mirror, fetcher)
    }

    /// Build the context around the given upstream sources.
    pub fn with_sources(
        config: ProgressConfig,
        mirror: Arc<dyn RepositoryMirror>,
        fetcher: Arc<dyn PassingSetSource>,
    ) -> anyhow::Result<Self> {
        let store = SnapshotStore::open(&config.database.path).with_context(|| {
            format!("Failed to open database {}", config.database.path.display())
        })?;
        let metrics = ProgressMetrics::new().context("Failed to register metrics")?;

        // Gauges start from the persisted snapshot.
        let counts = store.counts().context("Failed to read stored counts")?;
        metrics.restore_counts(counts);

        let reconciler = Arc::new(Reconciler::new(
            store,
            mirror,
            fetcher,
            Arc::new(metrics.clone()),
            ReconcilerSettings::from_config(&config),
        ));
        let dispatcher = WebhookDispatcher::new(config.webhooks.clone(), reconciler.clone());

        Ok(Self {
            config: Arc::new(config),
            metrics,
            reconciler,
            dispatcher,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    pub fn http_state(&self) -> HttpState {
        HttpState {
            reconciler: self.reconciler.clone(),
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
            version: self.version,
            started_at: self.started_at,
        }
    }
}
