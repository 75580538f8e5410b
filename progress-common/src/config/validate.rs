//! Startup validation of a loaded configuration.

use super::ProgressConfig;
use super::env::parse_log_level;
use std::collections::HashSet;

/// A single problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, returning every issue found.
pub fn validate_config(config: &ProgressConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if parse_log_level(&config.log_level).is_none() {
        issues.push(ConfigIssue::new(
            "log_level",
            format!("unknown level '{}'", config.log_level),
        ));
    }
    if !is_http_url(&config.manifest_url) {
        issues.push(ConfigIssue::new("manifest_url", "must be an http(s) URL"));
    }
    if config.git.repository_url.trim().is_empty() {
        issues.push(ConfigIssue::new("git.repository_url", "must not be empty"));
    }
    if config.git.tests_subdir.is_absolute() {
        issues.push(ConfigIssue::new(
            "git.tests_subdir",
            "must be relative to the checkout",
        ));
    }
    if config.git.timeout_secs == 0 {
        issues.push(ConfigIssue::new("git.timeout_secs", "must be positive"));
    }
    if config.fetch.timeout_secs == 0 {
        issues.push(ConfigIssue::new("fetch.timeout_secs", "must be positive"));
    }
    if config.http.port == 0 {
        issues.push(ConfigIssue::new("http.port", "must be between 1 and 65535"));
    }
    if config.database.path.as_os_str().is_empty() {
        issues.push(ConfigIssue::new("database.path", "must not be empty"));
    }

    let mut seen = HashSet::new();
    for (idx, source) in config.webhooks.iter().enumerate() {
        let field = format!("webhooks[{idx}]");
        if !is_slug(&source.name) {
            issues.push(ConfigIssue::new(
                format!("{field}.name"),
                format!(
                    "'{}' must be lowercase letters, digits or '-'",
                    source.name
                ),
            ));
        }
        if !seen.insert(source.name.as_str()) {
            issues.push(ConfigIssue::new(
                format!("{field}.name"),
                format!("duplicate source '{}'", source.name),
            ));
        }
        if source.secret.is_empty() {
            issues.push(ConfigIssue::new(
                format!("{field}.secret"),
                format!("secret for '{}' must not be empty", source.name),
            ));
        }
    }

    issues
}

fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_slug(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
