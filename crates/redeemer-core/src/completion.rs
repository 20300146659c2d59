//! Bundle completion record.
//!
//! A bundle whose keys are all selected and terminal in the ledger is marked
//! complete, and later runs skip it before any network call that references
//! it. The record is an optimization only: an unreadable file is treated as
//! empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::ledger::LedgerSnapshot;
use crate::model::KeyRecord;

pub const COMPLETION_FILE: &str = ".choice_completed.json";
pub const COMPLETION_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionFile {
    completed_months: BTreeSet<String>,
    last_updated: Option<DateTime<Utc>>,
    #[serde(default = "default_version")]
    version: u32,
}

fn default_version() -> u32 {
    COMPLETION_VERSION
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Current(CompletionFile),
    Legacy(Vec<String>),
}

/// `IsComplete` / `MarkComplete` over `.choice_completed.json`.
#[derive(Debug)]
pub struct CompletionTracker {
    path: PathBuf,
    completed: BTreeSet<String>,
}

impl CompletionTracker {
    /// Load the record from `dir`. Missing or corrupt files yield an empty set.
    #[must_use]
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(COMPLETION_FILE);
        let completed = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<OnDisk>(&text) {
                Ok(OnDisk::Current(file)) => file.completed_months,
                Ok(OnDisk::Legacy(list)) => list.into_iter().collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt completion record");
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable completion record");
                BTreeSet::new()
            }
        };
        Self { path, completed }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_complete(&self, bundle: &str) -> bool {
        self.completed.contains(bundle)
    }

    pub fn completed(&self) -> impl Iterator<Item = &str> {
        self.completed.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Record `bundle` as complete and persist. Returns false if it already was.
    pub fn mark_complete(&mut self, bundle: &str) -> Result<bool> {
        if !self.completed.insert(bundle.to_string()) {
            return Ok(false);
        }
        self.save()?;
        debug!(bundle, "Marked bundle complete");
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        let file = CompletionFile {
            completed_months: self.completed.clone(),
            last_updated: Some(Utc::now()),
            version: COMPLETION_VERSION,
        };
        let body = serde_json::to_vec_pretty(&file)?;
        let write_err = |e: std::io::Error| LedgerError::Write {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut out = std::fs::File::create(&tmp).map_err(write_err)?;
            out.write_all(&body).map_err(write_err)?;
            out.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    /// Whether `keys` (every key of `bundle`) are all selected and terminal.
    #[must_use]
    pub fn evaluate(bundle: &str, keys: &[&KeyRecord], ledger: &LedgerSnapshot) -> bool {
        if keys.is_empty() {
            return false;
        }
        let pending = keys
            .iter()
            .filter(|k| k.is_choice_unclaimed || !ledger.is_terminal(&k.id()))
            .count();
        if pending > 0 {
            debug!(bundle, pending, "Bundle not complete");
        }
        pending == 0
    }
}
