//! Configuration system for the progress daemon.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - A TOML file (`config.toml` by default)
//! - `PROGRESS_*` environment variable overrides
//!
//! Relative paths are resolved against the working directory once, at load
//! time, so the rest of the daemon only ever sees absolute paths.

pub mod env;
pub mod validate;

pub use env::{EnvError, EnvParser};
pub use validate::{ConfigIssue, validate_config};

use crate::types::TestSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to resolve path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid environment overrides: {}", join_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {}", join_issues(.0))]
    Invalid(Vec<ConfigIssue>),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// URL of the newline-delimited manifest of passing tests.
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Inbound webhook sources and the set each one refreshes.
    #[serde(default = "default_webhooks")]
    pub webhooks: Vec<WebhookSourceConfig>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            manifest_url: default_manifest_url(),
            git: GitConfig::default(),
            fetch: FetchConfig::default(),
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            refresh: RefreshConfig::default(),
            webhooks: default_webhooks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Remote URL of the test-suite repository.
    #[serde(default = "default_repository_url")]
    pub repository_url: String,
    /// Local checkout directory.
    #[serde(default = "default_checkout_dir")]
    pub checkout_dir: PathBuf,
    /// Directory inside the checkout holding test-definition files.
    #[serde(default = "default_tests_subdir")]
    pub tests_subdir: PathBuf,
    /// Timeout for each git invocation.
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Directory scanned for test declarations.
    pub fn tests_dir(&self) -> PathBuf {
        self.checkout_dir.join(&self.tests_subdir)
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repository_url: default_repository_url(),
            checkout_dir: default_checkout_dir(),
            tests_subdir: default_tests_subdir(),
            timeout_secs: default_git_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout for the manifest request.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between periodic full refreshes. Zero disables the ticker.
    #[serde(default)]
    pub interval_secs: u64,
    /// Keep serving the persisted snapshot if the startup refresh fails.
    #[serde(default)]
    pub allow_initial_failure: bool,
}

impl RefreshConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// One upstream webhook sender.
///
/// The route is `POST /<name>-webhook`.
#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    pub name: String,
    pub secret: String,
    /// The set refreshed when this source reports a push.
    pub refresh: TestSet,
}

impl WebhookSourceConfig {
    pub fn route(&self) -> String {
        format!("/{}-webhook", self.name)
    }
}

impl std::fmt::Debug for WebhookSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSourceConfig")
            .field("name", &self.name)
            .field("secret", &"***")
            .field("refresh", &self.refresh)
            .finish()
    }
}

impl ProgressConfig {
    /// Load configuration from `path`, or from `config.toml` in the working
    /// directory if it exists, then apply environment overrides, resolve
    /// relative paths and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        config.resolve_paths()?;

        let issues = validate_config(&config);
        if !issues.is_empty() {
            return Err(ConfigError::Invalid(issues));
        }
        Ok(config)
    }

    /// Parse a configuration file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `PROGRESS_*` environment overrides.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        self.log_level = parser.get_log_level("LOG_LEVEL", &self.log_level);
        self.manifest_url = parser.get_string("MANIFEST_URL", &self.manifest_url);
        self.git.repository_url = parser.get_string("GIT_REPOSITORY_URL", &self.git.repository_url);
        self.http.port = parser.get_u16_range("HTTP_PORT", self.http.port, 1, u16::MAX);
        self.database.path = parser.get_path("DATABASE_PATH", &self.database.path);
        for source in &mut self.webhooks {
            let name = format!("WEBHOOK_{}_SECRET", env::env_key(&source.name));
            source.secret = parser.get_string(&name, &source.secret);
        }
    }

    /// Make relative checkout and database paths absolute.
    pub fn resolve_paths(&mut self) -> Result<(), ConfigError> {
        self.git.checkout_dir = absolutize(&self.git.checkout_dir)?;
        self.database.path = absolutize(&self.database.path)?;
        Ok(())
    }

    /// Look up a webhook source by name.
    pub fn webhook(&self, name: &str) -> Option<&WebhookSourceConfig> {
        self.webhooks.iter().find(|source| source.name == name)
    }

    /// Render the configuration as TOML with secrets masked.
    pub fn to_redacted_toml(&self) -> String {
        let mut redacted = self.clone();
        for source in &mut redacted.webhooks {
            source.secret = "***".to_string();
        }
        toml::to_string_pretty(&redacted).unwrap_or_else(|e| format!("# unable to render: {e}"))
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| ConfigError::Resolve {
            path: path.to_path_buf(),
            source,
        })
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_manifest_url() -> String {
    "https://raw.githubusercontent.com/matrix-org/dendrite/master/testfile".to_string()
}

fn default_repository_url() -> String {
    "https://github.com/matrix-org/sytest".to_string()
}

fn default_checkout_dir() -> PathBuf {
    PathBuf::from("sytest")
}

fn default_tests_subdir() -> PathBuf {
    PathBuf::from("tests")
}

fn default_git_timeout() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("stats.db")
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_webhooks() -> Vec<WebhookSourceConfig> {
    vec![
        WebhookSourceConfig {
            name: "server".to_string(),
            secret: String::new(),
            refresh: TestSet::Passing,
        },
        WebhookSourceConfig {
            name: "testsuite".to_string(),
            secret: String::new(),
            refresh: TestSet::Total,
        },
    ]
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
