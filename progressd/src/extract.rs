//! Test identifier extraction from a test-suite checkout.
//!
//! Test files declare each case on a line of the form:
//!
//! ```text
//! test "Can register a user",
//! ```
//!
//! The quoted text is the test identifier. Everything after the closing quote
//! is ignored.

use progress_common::TestIdentifierSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Literal that opens a test declaration.
pub const DECLARATION_PREFIX: &str = "test \"";

/// Errors raised while scanning a checkout.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("test directory {0} does not exist")]
    MissingRoot(PathBuf),

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: unterminated test name")]
    Unterminated { path: PathBuf, line: usize },

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A test name declared more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateDeclaration {
    pub identifier: String,
    pub path: PathBuf,
    pub line: usize,
}

/// Result of scanning a directory tree.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub identifiers: TestIdentifierSet,
    /// Every declaration after the first of the same name, in scan order.
    pub duplicates: Vec<DuplicateDeclaration>,
    pub files_scanned: usize,
}

/// A declaration line whose name has no closing quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnterminatedName;

/// Parse one line. Returns `Ok(None)` for lines that are not declarations.
pub fn parse_declaration(line: &str) -> Result<Option<String>, UnterminatedName> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(rest) = line.strip_prefix(DECLARATION_PREFIX) else {
        return Ok(None);
    };

    let mut name = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('"') => name.push('"'),
                Some('\\') => name.push('\\'),
                Some(other) => {
                    name.push('\\');
                    name.push(other);
                }
                None => return Err(UnterminatedName),
            },
            '"' => return Ok(Some(name)),
            other => name.push(other),
        }
    }
    Err(UnterminatedName)
}

/// Scan a single file's contents, adding declarations to `extraction`.
fn scan_contents(path: &Path, contents: &str, extraction: &mut Extraction) -> Result<(), ExtractError> {
    for (idx, line) in contents.lines().enumerate() {
        let identifier = match parse_declaration(line) {
            Ok(Some(identifier)) => identifier,
            Ok(None) => continue,
            Err(UnterminatedName) => {
                return Err(ExtractError::Unterminated {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
        };

        if !extraction.identifiers.insert(identifier.clone()) {
            warn!(
                test = %identifier,
                path = %path.display(),
                line = idx + 1,
                "Test declared more than once"
            );
            extraction.duplicates.push(DuplicateDeclaration {
                identifier,
                path: path.to_path_buf(),
                line: idx + 1,
            });
        }
    }
    Ok(())
}

/// Recursively extract every declared test identifier under `root`.
///
/// Files are visited in name order. Any unreadable file or malformed
/// declaration aborts the whole scan.
pub fn extract_identifiers(root: &Path) -> Result<Extraction, ExtractError> {
    if !root.is_dir() {
        return Err(ExtractError::MissingRoot(root.to_path_buf()));
    }

    let mut extraction = Extraction::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| ExtractError::Walk {
            path: source
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf()),
            source,
        })?;
        if entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let bytes = std::fs::read(path).map_err(|source| ExtractError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        scan_contents(path, &String::from_utf8_lossy(&bytes), &mut extraction)?;
        extraction.files_scanned += 1;
    }

    debug!(
        root = %root.display(),
        files = extraction.files_scanned,
        tests = extraction.identifiers.len(),
        duplicates = extraction.duplicates.len(),
        "Extracted test identifiers"
    );
    Ok(extraction)
}

/// [`extract_identifiers`] on the blocking pool.
pub async fn extract_identifiers_blocking(root: PathBuf) -> Result<Extraction, ExtractError> {
    tokio::task::spawn_blocking(move || extract_identifiers(&root)).await?
}
