//! Key batches read from a JSON file.
//!
//! Accepted shapes:
//! - `{ "keys": [...], "bundles": [...] }`
//! - a bare array of keys
//! - an array of orders, each with `gamekey` and `tpkd_dict.all_tpks`
//!
//! An entry that does not parse as a key is reported as a source failure and
//! skipped; the rest of the file is still used.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use redeemer_core::Result;
use redeemer_core::model::{BundleInfo, KeyRecord};
use redeemer_core::redemption::{KeySource, RevealResult, SourceBatch};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyFile {
    Batch {
        keys: Vec<Value>,
        #[serde(default)]
        bundles: Vec<BundleInfo>,
    },
    Entries(Vec<Value>),
}

/// Key source over a JSON export. Keys without a value cannot be revealed.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse key file text into a batch.
pub fn parse_batch(text: &str) -> Result<SourceBatch> {
    let (entries, bundles) = match serde_json::from_str::<KeyFile>(text)? {
        KeyFile::Batch { keys, bundles } => (keys, bundles),
        KeyFile::Entries(entries) => (entries, Vec::new()),
    };

    let mut batch = SourceBatch {
        bundles,
        ..SourceBatch::default()
    };
    for (index, entry) in entries.into_iter().enumerate() {
        if let Some(tpks) = entry.pointer("/tpkd_dict/all_tpks").and_then(Value::as_array) {
            let gamekey = entry.get("gamekey").and_then(Value::as_str).unwrap_or_default();
            for (tpk_index, tpk) in tpks.iter().enumerate() {
                let mut tpk = tpk.clone();
                if let Some(fields) = tpk.as_object_mut() {
                    fields
                        .entry("gamekey")
                        .or_insert_with(|| Value::String(gamekey.to_string()));
                }
                push_entry(&mut batch, tpk, &format!("order {index} key {tpk_index}"));
            }
        } else {
            push_entry(&mut batch, entry, &format!("entry {index}"));
        }
    }
    Ok(batch)
}

fn push_entry(batch: &mut SourceBatch, entry: Value, label: &str) {
    match serde_json::from_value::<KeyRecord>(entry) {
        Ok(key) if key.gamekey.trim().is_empty() => {
            batch.failures.push(format!("{label}: empty gamekey"));
        }
        Ok(key) => batch.keys.push(key),
        Err(e) => batch.failures.push(format!("{label}: {e}")),
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn load(&self) -> Result<SourceBatch> {
        let shown = self.path.display().to_string();
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("{shown}: {e}")))?;
        let batch = parse_batch(&text)?;
        debug!(
            path = %shown,
            keys = batch.keys.len(),
            failures = batch.failures.len(),
            "Read key file"
        );
        Ok(batch)
    }

    async fn reveal(&self, _key: &KeyRecord) -> RevealResult {
        RevealResult::Failed("key file has no value for this key".to_string())
    }

    async fn keep_alive(&self) -> Result<()> {
        Ok(())
    }
}
