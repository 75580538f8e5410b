//! Local mirror of the test-suite repository.
//!
//! The checkout is cloned on first use and fast-forwarded afterwards. Every
//! operation on a given checkout path runs under that path's lock, so a pull
//! can never start while a clone (or another pull) of the same path is in
//! flight.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Errors raised while cloning or updating a checkout.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0} exists but is not a git checkout")]
    NotACheckout(PathBuf),

    #[error("failed to prepare checkout at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What an `ensure_up_to_date` call did to the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The checkout did not exist and was cloned.
    Cloned { head: String },
    /// New commits were pulled.
    Updated { from: String, to: String },
    /// The checkout already matched the remote.
    AlreadyUpToDate { head: String },
}

impl MirrorOutcome {
    pub fn head(&self) -> &str {
        match self {
            Self::Cloned { head } | Self::AlreadyUpToDate { head } => head,
            Self::Updated { to, .. } => to,
        }
    }
}

/// Keeps a checkout of a remote repository current.
#[async_trait]
pub trait RepositoryMirror: Send + Sync {
    /// Clone `remote_url` into `path` if it is absent, otherwise pull.
    ///
    /// On error any previous checkout at `path` is left as it was.
    async fn ensure_up_to_date(
        &self,
        path: &Path,
        remote_url: &str,
    ) -> Result<MirrorOutcome, MirrorError>;
}

/// Per-path mutual exclusion for checkout directories.
///
/// Paths are keyed canonically, so `a/../suite` and `suite` share a lock even
/// before the checkout exists.
#[derive(Default)]
pub struct CheckoutLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl CheckoutLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let key = lock_key(path);
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// [`RepositoryMirror`] driving the `git` command-line client.
pub struct GitCliMirror {
    git: PathBuf,
    timeout: Duration,
    locks: CheckoutLocks,
}

impl GitCliMirror {
    pub fn new(timeout: Duration) -> Self {
        Self {
            git: PathBuf::from("git"),
            timeout,
            locks: CheckoutLocks::new(),
        }
    }

    /// Use a specific git binary instead of the one on `PATH`.
    pub fn with_git_binary(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    fn command(&self, dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.git);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, description: &str) -> Result<String, MirrorError> {
        debug!(command = description, "Running git");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| MirrorError::Timeout {
                command: description.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| MirrorError::Spawn {
                command: description.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(MirrorError::CommandFailed {
                command: description.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn head(&self, path: &Path) -> Result<String, MirrorError> {
        let mut cmd = self.command(Some(path));
        cmd.args(["rev-parse", "HEAD"]);
        self.run(cmd, "git rev-parse HEAD").await
    }

    async fn clone_into(&self, path: &Path, remote_url: &str) -> Result<MirrorOutcome, MirrorError> {
        let staging = staging_path(path);
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MirrorError::Staging {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        info!(url = remote_url, path = %path.display(), "Cloning test suite");
        let mut cmd = self.command(None);
        cmd.args(["clone", "--quiet", "--depth", "1", remote_url])
            .arg(&staging);

        if let Err(err) = self.run(cmd, "git clone").await {
            discard_staging(&staging).await;
            return Err(err);
        }

        if let Err(source) = tokio::fs::rename(&staging, path).await {
            discard_staging(&staging).await;
            return Err(MirrorError::Staging {
                path: path.to_path_buf(),
                source,
            });
        }

        let head = self.head(path).await?;
        Ok(MirrorOutcome::Cloned { head })
    }

    async fn pull(&self, path: &Path) -> Result<MirrorOutcome, MirrorError> {
        if !path.join(".git").exists() {
            return Err(MirrorError::NotACheckout(path.to_path_buf()));
        }

        let before = self.head(path).await?;
        debug!(path = %path.display(), head = %before, "Updating test suite checkout");

        let mut cmd = self.command(Some(path));
        cmd.args(["pull", "--quiet", "--ff-only", "origin"]);
        self.run(cmd, "git pull").await?;

        let after = self.head(path).await?;
        if after == before {
            Ok(MirrorOutcome::AlreadyUpToDate { head: after })
        } else {
            Ok(MirrorOutcome::Updated {
                from: before,
                to: after,
            })
        }
    }
}

#[async_trait]
impl RepositoryMirror for GitCliMirror {
    async fn ensure_up_to_date(
        &self,
        path: &Path,
        remote_url: &str,
    ) -> Result<MirrorOutcome, MirrorError> {
        let _guard = self.locks.acquire(path).await;

        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| MirrorError::Staging {
                path: path.to_path_buf(),
                source,
            })?;
        if exists {
            self.pull(path).await
        } else {
            self.clone_into(path, remote_url).await
        }
    }
}

/// Canonical form of `path`. A missing last component is joined onto the
/// canonical parent.
fn lock_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    match (std::fs::canonicalize(parent), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

/// Sibling directory a clone is written to before being moved into place.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkout".to_string());
    let staging_name = format!(".{name}.partial-{}", uuid::Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(staging_name),
        None => PathBuf::from(staging_name),
    }
}

async fn discard_staging(staging: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), "Failed to remove partial clone: {}", e),
    }
}
