//! Build log persisted as one JSON file per entry plus a line index.
//!
//! ```text
//! <dir>/index                       # "<rfc3339> <id> <outcome>" per line
//! <dir>/<id>.json                   # full entry
//! ```
//!
//! The index is append-only during normal operation so listing history never
//! parses entry files. Garbage collection rewrites it atomically.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{
    BuildLog, BuildRecord, Clock, LogEntry, LogError, LogSummary, Outcome, entry_id,
};

const INDEX_FILE: &str = "index";

/// Build log rooted at a directory on disk.
pub struct FsBuildLog {
    dir: Utf8PathBuf,
    clock: Arc<dyn Clock>,
    writer: Mutex<()>,
}

impl FsBuildLog {
    /// Open (creating if needed) the log in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] when the directory cannot be created.
    pub fn open(dir: impl Into<Utf8PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self {
            dir,
            clock,
            writer: Mutex::new(()),
        })
    }

    /// Directory holding the log.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> Result<Utf8PathBuf, LogError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(self.dir.join(format!("{id}.json")))
        } else {
            Err(LogError::NotFound(format!("no entry with id '{id}'")))
        }
    }

    fn write_atomically(&self, path: &Utf8Path, bytes: &[u8]) -> Result<(), LogError> {
        let mut file = NamedTempFile::new_in(&self.dir).map_err(io_error(&self.dir))?;
        file.write_all(bytes).map_err(io_error(path))?;
        file.persist(path)
            .map_err(|err| io_error(path)(err.error))?;
        Ok(())
    }

    fn read_index(&self) -> Result<Vec<LogSummary>, LogError> {
        let path = self.dir.join(INDEX_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LogError::Io { path, source }),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(number, line)| {
                parse_index_line(line).ok_or_else(|| LogError::Corrupt {
                    path: path.clone(),
                    reason: format!("malformed index line {}", number + 1),
                })
            })
            .collect()
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(io::Error) -> LogError + '_ {
    move |source| LogError::Io {
        path: path.to_owned(),
        source,
    }
}

fn index_line(summary: &LogSummary) -> Result<String, LogError> {
    let timestamp = summary
        .timestamp
        .format(&Rfc3339)
        .map_err(|err| LogError::Corrupt {
            path: Utf8PathBuf::from(INDEX_FILE),
            reason: err.to_string(),
        })?;
    Ok(format!("{timestamp} {} {}\n", summary.id, summary.outcome))
}

fn parse_index_line(line: &str) -> Option<LogSummary> {
    let mut fields = line.split_whitespace();
    let timestamp = OffsetDateTime::parse(fields.next()?, &Rfc3339).ok()?;
    let id = fields.next()?.to_owned();
    let outcome = Outcome::parse(fields.next()?)?;
    fields.next().is_none().then_some(LogSummary {
        id,
        timestamp,
        outcome,
    })
}

impl BuildLog for FsBuildLog {
    fn record(&self, record: BuildRecord) -> Result<LogEntry, LogError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = self.read_index()?;
        let timestamp = self.clock.now();
        let mut sequence = existing.len();
        let mut id = entry_id(timestamp, sequence, &record.nodes);
        while existing.iter().any(|summary| summary.id == id) {
            sequence += 1;
            id = entry_id(timestamp, sequence, &record.nodes);
        }
        let entry = LogEntry {
            id,
            timestamp,
            outcome: record.outcome,
            nodes: record.nodes,
        };

        let path = self.entry_path(&entry.id)?;
        let json = serde_json::to_vec_pretty(&entry).map_err(|err| LogError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        self.write_atomically(&path, &json)?;

        let index = self.dir.join(INDEX_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .map_err(io_error(&index))?;
        file.write_all(index_line(&entry.summary())?.as_bytes())
            .map_err(io_error(&index))?;
        tracing::info!(id = %entry.id, outcome = %entry.outcome, "recorded build");
        Ok(entry)
    }

    fn summaries(&self) -> Result<Vec<LogSummary>, LogError> {
        self.read_index()
    }

    fn get(&self, id: &str) -> Result<LogEntry, LogError> {
        let path = self.entry_path(id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(LogError::NotFound(format!("no entry with id '{id}'")));
            }
            Err(source) => return Err(LogError::Io { path, source }),
        };
        serde_json::from_str(&text).map_err(|err| LogError::Corrupt {
            path,
            reason: err.to_string(),
        })
    }

    fn remove(&self, id: &str) -> Result<bool, LogError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let summaries = self.read_index()?;
        if !summaries.iter().any(|summary| summary.id == id) {
            return Ok(false);
        }
        let mut rewritten = String::new();
        for summary in summaries.iter().filter(|summary| summary.id != id) {
            rewritten.push_str(&index_line(summary)?);
        }
        self.write_atomically(&self.dir.join(INDEX_FILE), rewritten.as_bytes())?;
        let path = self.entry_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(LogError::Io { path, source }),
        }
    }
}
