//! In-memory stand-ins for the repository mirror and manifest fetcher.
//!
//! These let the reconciler, dispatcher and HTTP layer be exercised without
//! network access or a `git` binary.

use crate::fetch::{FetchError, PassingSetSource};
use crate::mirror::{MirrorError, MirrorOutcome, RepositoryMirror};
use async_trait::async_trait;
use progress_common::TestIdentifierSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A file in a fake test-suite tree: (path relative to the checkout, contents).
pub type SuiteFile = (String, String);

/// Build a suite file declaring `names` as tests.
pub fn suite_file(rel_path: &str, names: &[&str]) -> SuiteFile {
    let contents = names
        .iter()
        .map(|name| format!("test \"{name}\",\n    check => sub {{ 1 }};\n"))
        .collect::<String>();
    (rel_path.to_string(), contents)
}

/// Mirror that materializes a queue of suite revisions on disk.
///
/// Each call takes the next queued revision (or repeats the current one when
/// the queue is empty), wipes the checkout and writes the revision's files.
pub struct FakeMirror {
    revisions: Mutex<VecDeque<Vec<SuiteFile>>>,
    current: Mutex<Vec<SuiteFile>>,
    failure: Mutex<Option<String>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeMirror {
    pub fn new(files: Vec<SuiteFile>) -> Self {
        Self {
            revisions: Mutex::new(VecDeque::new()),
            current: Mutex::new(files),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Hold each call open for `delay` to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a revision for a later call.
    pub fn push_revision(&self, files: Vec<SuiteFile>) {
        lock(&self.revisions).push_back(files);
    }

    /// Make every later call fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Largest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn materialize(&self, path: &Path) -> Result<MirrorOutcome, MirrorError> {
        let existed = path.exists();
        let files = {
            let mut current = lock(&self.current);
            if let Some(next) = lock(&self.revisions).pop_front() {
                *current = next;
            }
            current.clone()
        };

        let staging_err = |source| MirrorError::Staging {
            path: path.to_path_buf(),
            source,
        };
        if existed {
            std::fs::remove_dir_all(path).map_err(staging_err)?;
        }
        for (rel, contents) in &files {
            let target = path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(staging_err)?;
            }
            std::fs::write(&target, contents).map_err(staging_err)?;
        }
        std::fs::create_dir_all(path).map_err(staging_err)?;

        let head = format!("rev{}", self.calls());
        Ok(if existed {
            MirrorOutcome::Updated {
                from: "previous".to_string(),
                to: head,
            }
        } else {
            MirrorOutcome::Cloned { head }
        })
    }
}

#[async_trait]
impl RepositoryMirror for FakeMirror {
    async fn ensure_up_to_date(
        &self,
        path: &Path,
        _remote_url: &str,
    ) -> Result<MirrorOutcome, MirrorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = lock(&self.failure).clone();
        let result = match failure {
            Some(stderr) => Err(MirrorError::CommandFailed {
                command: "git pull".to_string(),
                code: Some(1),
                stderr,
            }),
            None => self.materialize(path),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Fetcher returning a configurable manifest.
pub struct StaticFetcher {
    response: Mutex<Result<TestIdentifierSet, u16>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new<S: Into<String>>(identifiers: impl IntoIterator<Item = S>) -> Self {
        Self {
            response: Mutex::new(Ok(identifiers.into_iter().collect())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_identifiers<S: Into<String>>(&self, identifiers: impl IntoIterator<Item = S>) {
        *lock(&self.response) = Ok(identifiers.into_iter().collect());
    }

    /// Respond with an HTTP error status until the next `set_identifiers`.
    pub fn fail_with_status(&self, status: u16) {
        *lock(&self.response) = Err(status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PassingSetSource for StaticFetcher {
    async fn fetch_passing_identifiers(
        &self,
        manifest_url: &str,
    ) -> Result<TestIdentifierSet, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.response)
            .clone()
            .map_err(|status| FetchError::Status {
                url: manifest_url.to_string(),
                status,
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
