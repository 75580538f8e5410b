//! Shared configuration, logging and types for the test progress daemon.

pub mod config;
pub mod logging;
pub mod types;

pub use config::{ConfigError, ProgressConfig, WebhookSourceConfig};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use types::{ProgressCounts, TestIdentifierSet, TestSet};
