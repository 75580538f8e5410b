//! Refreshing the stored test sets from their upstream sources.
//!
//! A refresh pulls a fresh set from upstream, replaces the stored snapshot and
//! publishes the new count. Any failure before the replace leaves the stored
//! set and the published count untouched.

use crate::extract::{ExtractError, extract_identifiers_blocking};
use crate::fetch::{FetchError, PassingSetSource};
use crate::metrics::MetricsSink;
use crate::mirror::{MirrorError, RepositoryMirror};
use crate::store::{SnapshotStore, StoreError};
use chrono::{DateTime, Utc};
use progress_common::{ProgressConfig, TestSet};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Why a refresh did not complete.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("fetching passing tests failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("updating the test-suite checkout failed: {0}")]
    Mirror(#[from] MirrorError),

    #[error("extracting test names failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("storing the test set failed: {0}")]
    Store(#[from] StoreError),
}

/// Where each set comes from.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub manifest_url: String,
    pub repository_url: String,
    pub checkout_dir: PathBuf,
    /// Directory scanned for declarations, inside `checkout_dir`.
    pub tests_dir: PathBuf,
}

impl ReconcilerSettings {
    pub fn from_config(config: &ProgressConfig) -> Self {
        Self {
            manifest_url: config.manifest_url.clone(),
            repository_url: config.git.repository_url.clone(),
            checkout_dir: config.git.checkout_dir.clone(),
            tests_dir: config.git.tests_dir(),
        }
    }
}

/// Summary of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub set: TestSet,
    pub count: usize,
    /// Repeated declarations seen while extracting. Always 0 for `Passing`.
    pub duplicates: usize,
    /// Checkout commit the total set was read from.
    pub head: Option<String>,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of refreshing both sets.
#[derive(Debug)]
pub struct RefreshAll {
    pub total: Result<RefreshReport, RefreshError>,
    pub passing: Result<RefreshReport, RefreshError>,
}

impl RefreshAll {
    pub fn is_ok(&self) -> bool {
        self.total.is_ok() && self.passing.is_ok()
    }

    /// Failed refreshes, by set.
    pub fn errors(&self) -> Vec<(TestSet, &RefreshError)> {
        [(TestSet::Total, &self.total), (TestSet::Passing, &self.passing)]
            .into_iter()
            .filter_map(|(set, result)| result.as_ref().err().map(|e| (set, e)))
            .collect()
    }
}

/// Coordinates refreshes of the total and passing sets.
///
/// Refreshes of the same set are serialized so the stored result always
/// corresponds to one complete refresh. The two sets refresh independently.
pub struct Reconciler {
    store: SnapshotStore,
    mirror: Arc<dyn RepositoryMirror>,
    fetcher: Arc<dyn PassingSetSource>,
    metrics: Arc<dyn MetricsSink>,
    settings: ReconcilerSettings,
    total_lock: Mutex<()>,
    passing_lock: Mutex<()>,
    total_queued: AtomicBool,
    passing_queued: AtomicBool,
    last_success: RwLock<HashMap<TestSet, DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        store: SnapshotStore,
        mirror: Arc<dyn RepositoryMirror>,
        fetcher: Arc<dyn PassingSetSource>,
        metrics: Arc<dyn MetricsSink>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            mirror,
            fetcher,
            metrics,
            settings,
            total_lock: Mutex::new(()),
            passing_lock: Mutex::new(()),
            total_queued: AtomicBool::new(false),
            passing_queued: AtomicBool::new(false),
            last_success: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// When `set` last refreshed successfully, if ever.
    pub fn last_success(&self, set: TestSet) -> Option<DateTime<Utc>> {
        self.last_success
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&set)
            .copied()
    }

    fn lock_for(&self, set: TestSet) -> &Mutex<()> {
        match set {
            TestSet::Total => &self.total_lock,
            TestSet::Passing => &self.passing_lock,
        }
    }

    fn queued_for(&self, set: TestSet) -> &AtomicBool {
        match set {
            TestSet::Total => &self.total_queued,
            TestSet::Passing => &self.passing_queued,
        }
    }

    /// Re-fetch the passing manifest and replace the stored passing set.
    pub async fn refresh_passing(&self) -> Result<RefreshReport, RefreshError> {
        self.refresh(TestSet::Passing).await
    }

    /// Update the test-suite checkout, re-extract and replace the stored total set.
    pub async fn refresh_total(&self) -> Result<RefreshReport, RefreshError> {
        self.refresh(TestSet::Total).await
    }

    /// Refresh one set. Waits for any in-progress refresh of the same set.
    pub async fn refresh(&self, set: TestSet) -> Result<RefreshReport, RefreshError> {
        let _guard = self.lock_for(set).lock().await;
        self.refresh_locked(set).await
    }

    /// Refresh `set` unless another refresh of it is already waiting to start.
    ///
    /// A waiting refresh has not read upstream yet, so it will pick up
    /// whatever prompted this call. Returns `None` when folded into it.
    pub async fn refresh_coalesced(
        &self,
        set: TestSet,
    ) -> Option<Result<RefreshReport, RefreshError>> {
        let queued = self.queued_for(set);
        if queued.swap(true, Ordering::SeqCst) {
            debug!(kind = %set, "Refresh already queued");
            return None;
        }
        let _guard = self.lock_for(set).lock().await;
        queued.store(false, Ordering::SeqCst);
        Some(self.refresh_locked(set).await)
    }

    async fn refresh_locked(&self, set: TestSet) -> Result<RefreshReport, RefreshError> {
        let started = Instant::now();
        debug!(kind = %set, "Refresh started");

        let result = match set {
            TestSet::Total => self.pull_total().await,
            TestSet::Passing => self.pull_passing().await,
        };

        let (count, duplicates, head) = match result {
            Ok(done) => done,
            Err(e) => {
                self.metrics.record_failure(set);
                return Err(e);
            }
        };

        self.metrics.set_count(set, count);
        let finished_at = Utc::now();
        self.last_success
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(set, finished_at);

        let report = RefreshReport {
            set,
            count,
            duplicates,
            head,
            elapsed: started.elapsed(),
            finished_at,
        };
        info!(
            kind = %set,
            count,
            duplicates,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Refresh complete"
        );
        Ok(report)
    }

    /// Refresh both sets concurrently.
    pub async fn refresh_all(&self) -> RefreshAll {
        let (total, passing) = tokio::join!(self.refresh_total(), self.refresh_passing());
        RefreshAll { total, passing }
    }

    async fn pull_passing(&self) -> Result<(usize, usize, Option<String>), RefreshError> {
        let identifiers = self
            .fetcher
            .fetch_passing_identifiers(&self.settings.manifest_url)
            .await?;
        let count = identifiers.len();
        self.store
            .replace_blocking(TestSet::Passing, identifiers)
            .await?;
        Ok((count, 0, None))
    }

    async fn pull_total(&self) -> Result<(usize, usize, Option<String>), RefreshError> {
        let outcome = self
            .mirror
            .ensure_up_to_date(&self.settings.checkout_dir, &self.settings.repository_url)
            .await?;
        debug!(?outcome, "Checkout ready");

        let extraction = extract_identifiers_blocking(self.settings.tests_dir.clone()).await?;
        let count = extraction.identifiers.len();
        let duplicates = extraction.duplicates.len();
        self.store
            .replace_blocking(TestSet::Total, extraction.identifiers)
            .await?;
        Ok((count, duplicates, Some(outcome.head().to_string())))
    }
}
