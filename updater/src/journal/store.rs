//! Journal persistence backends

use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::UpdaterError;
use crate::filesys::file::File;
use crate::journal::ProgressJournal;

/// Durable home of the progress journal
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Load the journal; a store that was never written yields an empty one
    async fn load(&self) -> Result<ProgressJournal, UpdaterError>;

    /// Replace the persisted journal atomically
    async fn flush(&self, journal: &ProgressJournal) -> Result<(), UpdaterError>;
}

/// Journal kept as a JSON file `{done: [..], failed: [..], skipped: [..]}`
pub struct FileJournalStore {
    file: File,
}

impl FileJournalStore {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

#[async_trait]
impl JournalStore for FileJournalStore {
    async fn load(&self) -> Result<ProgressJournal, UpdaterError> {
        if !self.file.exists().await {
            return Ok(ProgressJournal::default());
        }
        let contents = self.file.read_string().await?;
        // A truncated file (e.g. cleared by housekeeping) is an empty journal.
        if contents.trim().is_empty() {
            return Ok(ProgressJournal::default());
        }
        serde_json::from_str(&contents).map_err(|e| {
            UpdaterError::JournalError(format!("{}: {}", self.file.path().display(), e))
        })
    }

    async fn flush(&self, journal: &ProgressJournal) -> Result<(), UpdaterError> {
        self.file
            .write_json(journal)
            .await
            .map_err(|e| UpdaterError::JournalError(format!("{}: {}", self.file.path().display(), e)))
    }
}

/// In-memory store that keeps every flushed snapshot
#[derive(Default)]
pub struct MemoryJournalStore {
    initial: ProgressJournal,
    flushed: Mutex<Vec<ProgressJournal>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: ProgressJournal) -> Self {
        Self {
            initial: journal,
            flushed: Mutex::new(Vec::new()),
        }
    }

    /// Number of flushes so far
    pub fn flush_count(&self) -> usize {
        self.flushed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Last flushed journal, or the initial one when nothing was flushed
    pub fn latest(&self) -> ProgressJournal {
        self.flushed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
            .unwrap_or_else(|| self.initial.clone())
    }

    /// Every flushed snapshot in order
    pub fn history(&self) -> Vec<ProgressJournal> {
        self.flushed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn load(&self) -> Result<ProgressJournal, UpdaterError> {
        Ok(self.latest())
    }

    async fn flush(&self, journal: &ProgressJournal) -> Result<(), UpdaterError> {
        self.flushed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(journal.clone());
        Ok(())
    }
}
