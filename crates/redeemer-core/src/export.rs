//! Offline key export. Never reveals or redeems anything.

use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::ledger::LedgerSnapshot;
use crate::model::KeyRecord;
use crate::resolver::OwnershipResolver;
use crate::tabular;

pub const EXPORT_HEADER: [&str; 9] = [
    "human_name",
    "redeemed_key_val",
    "is_gift",
    "key_type_human_name",
    "is_expired",
    "platform_ownership",
    "app_id",
    "gamekey",
    "ledger_outcome",
];

/// Which keys to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFilter {
    pub platform_only: bool,
    pub revealed: bool,
    pub unrevealed: bool,
}

impl Default for ExportFilter {
    fn default() -> Self {
        Self {
            platform_only: false,
            revealed: true,
            unrevealed: true,
        }
    }
}

impl ExportFilter {
    fn admits(&self, key: &KeyRecord) -> bool {
        if self.platform_only && !key.targets_platform() {
            return false;
        }
        if key.is_revealed() {
            self.revealed
        } else {
            self.unrevealed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub human_name: String,
    pub redeemed_key_val: String,
    pub is_gift: bool,
    pub key_type_human_name: String,
    pub is_expired: bool,
    /// OWNED / UNOWNED / UNKNOWN, empty without a catalog
    pub platform_ownership: String,
    pub app_id: Option<u32>,
    pub gamekey: String,
    pub ledger_outcome: String,
}

impl ExportRow {
    fn fields(&self) -> [String; 9] {
        [
            self.human_name.clone(),
            self.redeemed_key_val.clone(),
            self.is_gift.to_string(),
            self.key_type_human_name.clone(),
            self.is_expired.to_string(),
            self.platform_ownership.clone(),
            self.app_id.map(|id| id.to_string()).unwrap_or_default(),
            self.gamekey.clone(),
            self.ledger_outcome.clone(),
        ]
    }
}

/// Build export rows. Ownership columns are filled when `ownership` is given.
#[must_use]
pub fn export_keys(
    keys: &[KeyRecord],
    ledger: &LedgerSnapshot,
    ownership: Option<(&OwnershipResolver, &Catalog)>,
    filter: ExportFilter,
) -> Vec<ExportRow> {
    keys.iter()
        .filter(|k| filter.admits(k))
        .map(|key| {
            let resolution = ownership
                .filter(|_| key.targets_platform())
                .map(|(resolver, catalog)| resolver.resolve(key, catalog));
            ExportRow {
                human_name: key.name.clone(),
                redeemed_key_val: key.revealed().unwrap_or_default().to_string(),
                is_gift: key.is_gift,
                key_type_human_name: key.key_type_human_name.clone(),
                is_expired: key.expired,
                platform_ownership: resolution
                    .as_ref()
                    .map(|r| r.decision.to_string())
                    .unwrap_or_default(),
                app_id: resolution
                    .as_ref()
                    .and_then(|r| r.app_id)
                    .or(key.app_id_hint),
                gamekey: key.gamekey.clone(),
                ledger_outcome: ledger
                    .terminal_outcome(&key.id())
                    .map(|o| o.to_string())
                    .or_else(|| ledger.is_errored(&key.id()).then(|| "ERRORED".to_string()))
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Render rows as CSV with the export header.
#[must_use]
pub fn render_csv(rows: &[ExportRow]) -> String {
    let mut out = String::new();
    tabular::write_record(&mut out, &EXPORT_HEADER);
    for row in rows {
        tabular::write_record(&mut out, &row.fields());
    }
    out
}

/// Write rows to `path`.
pub fn write_csv(path: &Path, rows: &[ExportRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(render_csv(rows).as_bytes())?;
    file.sync_all()?;
    Ok(())
}
