//! Common types shared by the progress daemon and its configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::btree_set;

/// One of the two named test sets tracked by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSet {
    /// Every test known to exist in the test suite.
    Total,
    /// Every test the monitored project currently reports as passing.
    Passing,
}

impl TestSet {
    /// All test sets, in a fixed order.
    pub const ALL: [TestSet; 2] = [TestSet::Total, TestSet::Passing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Passing => "passing",
        }
    }

    /// Parse a set name as used in configuration files and metric labels.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "total" => Some(Self::Total),
            "passing" => Some(Self::Passing),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unordered collection of test identifiers.
///
/// Identifiers are compared by exact string equality. Iteration order is
/// lexicographic but carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestIdentifierSet(BTreeSet<String>);

impl TestIdentifierSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Insert an identifier. Returns `false` if it was already present.
    pub fn insert(&mut self, identifier: impl Into<String>) -> bool {
        self.0.insert(identifier.into())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for TestIdentifierSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IntoIterator for TestIdentifierSet {
    type Item = String;
    type IntoIter = btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TestIdentifierSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Sizes of both named sets at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub total: usize,
    pub passing: usize,
}

impl ProgressCounts {
    pub fn get(&self, set: TestSet) -> usize {
        match set {
            TestSet::Total => self.total,
            TestSet::Passing => self.passing,
        }
    }
}

impl std::fmt::Display for ProgressCounts {
    /// Renders as `<total>/<passing>`, the format served on the stats page.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.total, self.passing)
    }
}
