//! In-memory build log for tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BuildLog, BuildRecord, Clock, LogEntry, LogError, LogSummary, SystemClock, entry_id};

/// Build log held in memory; entries vanish on drop.
pub struct MemoryBuildLog {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryBuildLog {
    /// Create an empty log stamping entries with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBuildLog {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl BuildLog for MemoryBuildLog {
    fn record(&self, record: BuildRecord) -> Result<LogEntry, LogError> {
        let mut entries = self.lock();
        let timestamp = self.clock.now();
        let mut sequence = entries.len();
        let mut id = entry_id(timestamp, sequence, &record.nodes);
        while entries.iter().any(|entry| entry.id == id) {
            sequence += 1;
            id = entry_id(timestamp, sequence, &record.nodes);
        }
        let entry = LogEntry {
            id,
            timestamp,
            outcome: record.outcome,
            nodes: record.nodes,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    fn summaries(&self) -> Result<Vec<LogSummary>, LogError> {
        Ok(self.lock().iter().map(LogEntry::summary).collect())
    }

    fn get(&self, id: &str) -> Result<LogEntry, LogError> {
        self.lock()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| LogError::NotFound(format!("no entry with id '{id}'")))
    }

    fn remove(&self, id: &str) -> Result<bool, LogError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        Ok(entries.len() != before)
    }
}
