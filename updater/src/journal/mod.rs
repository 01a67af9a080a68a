//! Progress journal.
//!
//! Durable record of per-device terminal outcomes. A device sits in at most
//! one of `done`, `failed` and `skipped`; membership in `done` is what makes
//! a resumed run leave the device alone. Every mutation goes through
//! [`Journal::record`], which flushes before returning.

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::UpdaterError;

use self::store::JournalStore;

/// Terminal outcome of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Failed,
    Skipped,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done => f.write_str("done"),
            Outcome::Failed => f.write_str("failed"),
            Outcome::Skipped => f.write_str("skipped"),
        }
    }
}

/// Serialized journal contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressJournal {
    #[serde(default)]
    pub done: BTreeSet<String>,

    #[serde(default)]
    pub failed: BTreeSet<String>,

    #[serde(default)]
    pub skipped: BTreeSet<String>,

    /// Failure class or skip reason per device
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reasons: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressJournal {
    pub fn outcome_of(&self, id: &str) -> Option<Outcome> {
        if self.done.contains(id) {
            Some(Outcome::Done)
        } else if self.failed.contains(id) {
            Some(Outcome::Failed)
        } else if self.skipped.contains(id) {
            Some(Outcome::Skipped)
        } else {
            None
        }
    }

    /// Move `id` into the set for `outcome`, removing it from the others
    pub fn mark(&mut self, id: &str, outcome: Outcome, reason: Option<&str>) {
        self.done.remove(id);
        self.failed.remove(id);
        self.skipped.remove(id);
        self.reasons.remove(id);

        let set = match outcome {
            Outcome::Done => &mut self.done,
            Outcome::Failed => &mut self.failed,
            Outcome::Skipped => &mut self.skipped,
        };
        set.insert(id.to_string());

        if let Some(reason) = reason {
            self.reasons.insert(id.to_string(), reason.to_string());
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }

    /// True when no id appears in two sets
    pub fn is_consistent(&self) -> bool {
        self.done.is_disjoint(&self.failed)
            && self.done.is_disjoint(&self.skipped)
            && self.failed.is_disjoint(&self.skipped)
    }
}

/// Loaded journal bound to its store
pub struct Journal {
    store: Arc<dyn JournalStore>,
    state: ProgressJournal,
}

impl Journal {
    /// Load from the store.
    ///
    /// An unreadable journal is replaced by an empty one: losing resume
    /// information only costs redundant work, refusing to run blocks the fleet.
    pub async fn load(store: Arc<dyn JournalStore>) -> Self {
        let state = match store.load().await {
            Ok(state) if !state.is_consistent() => {
                warn!("Progress journal lists a device under several outcomes, starting empty");
                ProgressJournal::default()
            }
            Ok(state) => state,
            Err(e) => {
                warn!("Progress journal unreadable, starting empty: {}", e);
                ProgressJournal::default()
            }
        };
        Self { store, state }
    }

    pub fn state(&self) -> &ProgressJournal {
        &self.state
    }

    /// Record a terminal outcome and flush it before returning
    pub async fn record(&mut self, id: &str, outcome: Outcome, reason: Option<&str>) -> Result<(), UpdaterError> {
        self.state.mark(id, outcome, reason);
        debug!("Journal: {} -> {}", id, outcome);
        self.store.flush(&self.state).await
    }

    /// Forget every recorded outcome
    pub async fn reset(&mut self) -> Result<(), UpdaterError> {
        self.state = ProgressJournal::default();
        self.store.flush(&self.state).await
    }
}
