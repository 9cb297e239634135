//! Append-only record of build runs.
//!
//! Every executed build appends exactly one [`LogEntry`], whether the run
//! completed, failed, or was interrupted; plan-only runs are not recorded.
//! Entries are immutable; the only way to drop one is explicit garbage
//! collection.
//!
//! Entry identifiers combine a UTC timestamp and a short digest, for example
//! `20250301T120000-1a2b3c4d`, so they sort chronologically and are easy to
//! select by prefix or substring on the command line.

mod fs;
mod memory;

use std::fmt;
use std::io;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset, macros::format_description};

use crate::artifact::{ArtifactRef, Fingerprint};
use crate::language::Language;

pub use fs::FsBuildLog;
pub use memory::MemoryBuildLog;

/// Errors raised by build log implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum LogError {
    /// Nothing in the log matches the request.
    #[error("no build log entry found: {0}")]
    #[diagnostic(
        code(polyflow::log::not_found),
        help("run `polyflow log` to list recorded builds")
    )]
    NotFound(String),

    /// A selector matched several entries.
    #[error("selector '{selector}' matches {} build log entries", .candidates.len())]
    #[diagnostic(
        code(polyflow::log::ambiguous_selector),
        help("use a longer selector; candidates: {}", .candidates.join(", "))
    )]
    AmbiguousSelector {
        /// The selector as given.
        selector: String,
        /// Identifiers of every matching entry.
        candidates: Vec<String>,
    },

    /// Reading or writing the durable medium failed.
    #[error("build log I/O failed at '{path}'")]
    #[diagnostic(code(polyflow::log::io))]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// A log file could not be decoded.
    #[error("corrupt build log at '{path}': {reason}")]
    #[diagnostic(code(polyflow::log::corrupt))]
    Corrupt {
        /// Offending file.
        path: Utf8PathBuf,
        /// What was wrong.
        reason: String,
    },
}

/// Overall result of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Every node was rebuilt or reused.
    Complete,
    /// At least one node failed.
    Failed,
    /// The run was cancelled before all nodes were dispatched.
    Interrupted,
}

impl Outcome {
    /// Lowercase label used in logs and the index file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Executed and stored in this run.
    Rebuilt,
    /// Served from the store without executing.
    Reused,
    /// Execution failed.
    Failed,
    /// Not attempted because an upstream failed.
    Blocked,
    /// Not dispatched because the run was cancelled.
    Cancelled,
    /// Stale but not executed because the run only planned.
    Pending,
}

impl NodeStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rebuilt => "rebuilt",
            Self::Reused => "reused",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::Pending => "pending",
        }
    }

    /// Whether the node has an artifact in the store after the run.
    #[must_use]
    pub const fn is_built(self) -> bool {
        matches!(self, Self::Rebuilt | Self::Reused)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node line of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Derivation name.
    pub name: String,
    /// Derivation language.
    pub language: Language,
    /// Fingerprint computed for this run.
    pub fingerprint: Fingerprint,
    /// Final status.
    pub status: NodeStatus,
    /// Stored artifact, present when the node was rebuilt or reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Failure message for failed nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input to [`BuildLog::record`]: everything except the identity and time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    /// Run outcome.
    pub outcome: Outcome,
    /// Every node of the pipeline, in build order.
    pub nodes: Vec<NodeRecord>,
}

/// A recorded build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier.
    pub id: String,
    /// When the entry was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Run outcome.
    pub outcome: Outcome,
    /// Every node of the pipeline, in build order.
    pub nodes: Vec<NodeRecord>,
}

impl LogEntry {
    /// The record for `name`, if the run included it.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Headline information about this entry.
    #[must_use]
    pub fn summary(&self) -> LogSummary {
        LogSummary {
            id: self.id.clone(),
            timestamp: self.timestamp,
            outcome: self.outcome,
        }
    }
}

/// Headline information about a log entry, cheap to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSummary {
    /// Entry identifier.
    pub id: String,
    /// When the entry was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Run outcome.
    pub outcome: Outcome,
}

/// Source of timestamps for new log entries.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Durable, append-only storage for build runs.
pub trait BuildLog: Send + Sync {
    /// Append a new entry for `record`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when the entry cannot be written.
    fn record(&self, record: BuildRecord) -> Result<LogEntry, LogError>;

    /// Every summary in chronological order.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when the index cannot be read.
    fn summaries(&self) -> Result<Vec<LogSummary>, LogError>;

    /// Load the entry with exactly this identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotFound`] for unknown identifiers.
    fn get(&self, id: &str) -> Result<LogEntry, LogError>;

    /// Delete an entry. Only garbage collection calls this.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when deletion fails.
    fn remove(&self, id: &str) -> Result<bool, LogError>;

    /// Resolve `selector` against the log.
    ///
    /// An exact identifier wins; otherwise the selector must be a substring
    /// of exactly one identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AmbiguousSelector`] when several entries match and
    /// [`LogError::NotFound`] when none do.
    fn select(&self, selector: &str) -> Result<LogEntry, LogError> {
        let summaries = self.summaries()?;
        let summary = resolve_selector(&summaries, selector)?;
        self.get(&summary.id)
    }

    /// Find the record of `name` in a historical build.
    ///
    /// Without a selector the most recent entry holding an artifact for
    /// `name` is used.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when no entry matches or the node has no artifact
    /// in the selected entry.
    fn find(&self, name: &str, selector: Option<&str>) -> Result<(LogEntry, NodeRecord), LogError> {
        if let Some(selector) = selector {
            let entry = self.select(selector)?;
            let node = entry
                .node(name)
                .filter(|node| node.artifact.is_some())
                .cloned()
                .ok_or_else(|| {
                    LogError::NotFound(format!("'{name}' has no artifact in build {}", entry.id))
                })?;
            return Ok((entry, node));
        }
        for summary in self.summaries()?.iter().rev() {
            let entry = self.get(&summary.id)?;
            if let Some(node) = entry.node(name).filter(|node| node.artifact.is_some()) {
                let node = node.clone();
                return Ok((entry, node));
            }
        }
        Err(LogError::NotFound(format!("no build produced '{name}'")))
    }
}

impl dyn BuildLog + '_ {
    /// Most-recent-first history of the log.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] when the index cannot be read.
    pub fn list(&self) -> Result<LogHistory<'_>, LogError> {
        Ok(LogHistory::new(self, self.summaries()?))
    }
}

/// Reverse-chronological view of a build log.
///
/// Summaries come from the index; full entries are loaded only when
/// [`LogHistory::entries`] is iterated. The view can be iterated any number of
/// times.
pub struct LogHistory<'a> {
    log: &'a dyn BuildLog,
    summaries: Vec<LogSummary>,
}

impl<'a> LogHistory<'a> {
    /// Wrap chronologically ordered `summaries` read from `log`.
    #[must_use]
    pub fn new(log: &'a dyn BuildLog, summaries: Vec<LogSummary>) -> Self {
        Self { log, summaries }
    }

    /// Summaries, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogSummary> {
        self.summaries.iter().rev()
    }

    /// Full entries, newest first, each loaded on demand.
    pub fn entries(&self) -> impl Iterator<Item = Result<LogEntry, LogError>> + '_ {
        self.iter().map(|summary| self.log.get(&summary.id))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

impl<'h> IntoIterator for &'h LogHistory<'_> {
    type Item = &'h LogSummary;
    type IntoIter = std::iter::Rev<std::slice::Iter<'h, LogSummary>>;

    fn into_iter(self) -> Self::IntoIter {
        self.summaries.iter().rev()
    }
}

/// Pick the single summary identified by `selector`.
///
/// # Errors
///
/// Returns [`LogError::AmbiguousSelector`] or [`LogError::NotFound`].
pub fn resolve_selector<'s>(
    summaries: &'s [LogSummary],
    selector: &str,
) -> Result<&'s LogSummary, LogError> {
    if let Some(exact) = summaries.iter().find(|summary| summary.id == selector) {
        return Ok(exact);
    }
    let matches: Vec<&LogSummary> = summaries
        .iter()
        .filter(|summary| summary.id.contains(selector))
        .collect();
    match matches.as_slice() {
        [] => Err(LogError::NotFound(format!("no entry matches '{selector}'"))),
        [only] => Ok(*only),
        many => Err(LogError::AmbiguousSelector {
            selector: selector.to_owned(),
            candidates: many.iter().map(|summary| summary.id.clone()).collect(),
        }),
    }
}

/// Build the identifier for the `sequence`-th entry recorded at `timestamp`.
pub(crate) fn entry_id(timestamp: OffsetDateTime, sequence: usize, nodes: &[NodeRecord]) -> String {
    let utc = timestamp.to_offset(UtcOffset::UTC);
    let stamp = utc
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]"
        ))
        .unwrap_or_else(|_| utc.unix_timestamp().to_string());
    let mut hasher = Sha256::new();
    hasher.update(stamp.as_bytes());
    hasher.update(sequence.to_string().as_bytes());
    for node in nodes {
        hasher.update(node.fingerprint.as_str().as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{stamp}-{}", digest.get(..8).unwrap_or(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    fn summary(id: &str) -> LogSummary {
        LogSummary {
            id: id.to_owned(),
            timestamp: datetime!(2025-03-01 12:00 UTC),
            outcome: Outcome::Complete,
        }
    }

    fn history() -> Vec<LogSummary> {
        vec![
            summary("20250301T120000-aaaa1111"),
            summary("20250301T120000-aaaa2222"),
            summary("20250302T090000-bbbb3333"),
        ]
    }

    #[rstest]
    #[case("20250301T120000-aaaa1111", "20250301T120000-aaaa1111")]
    #[case("2222", "20250301T120000-aaaa2222")]
    #[case("20250302", "20250302T090000-bbbb3333")]
    fn selectors_resolve_to_one_entry(#[case] selector: &str, #[case] expected: &str) {
        let summaries = history();
        let found = resolve_selector(&summaries, selector).expect("match");
        assert_eq!(found.id, expected);
    }

    #[test]
    fn shared_substrings_are_ambiguous() {
        let summaries = history();
        let err = resolve_selector(&summaries, "aaaa").expect_err("ambiguous");
        assert!(matches!(
            err,
            LogError::AmbiguousSelector { ref candidates, .. } if candidates.len() == 2
        ));
    }

    #[test]
    fn unknown_selectors_are_not_found() {
        assert!(matches!(
            resolve_selector(&history(), "zzzz"),
            Err(LogError::NotFound(_))
        ));
    }

    #[test]
    fn identifiers_embed_utc_timestamp() {
        let local = datetime!(2025-03-01 13:30:05 +1);
        let id = entry_id(local, 0, &[]);
        assert!(id.starts_with("20250301T123005-"), "{id}");
        assert_eq!(id.len(), "20250301T123005-".len() + 8);
        assert_ne!(id, entry_id(local, 1, &[]));
    }
}
