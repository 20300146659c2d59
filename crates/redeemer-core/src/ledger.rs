//! Durable outcome ledger.
//!
//! One CSV file per [`RedemptionOutcome`] in the data directory. A key
//! identity `(gamekey, name)` lives in at most one terminal file, and leaves
//! `errored.csv` as soon as it reaches any terminal file.
//!
//! Every mutation is a read-modify-write under an exclusive advisory lock on
//! `.ledger.lock`. Files are replaced through `<file>.tmp` + fsync + rename,
//! so readers never observe a torn file. Terminal files are written before
//! the errored file: a crash in between leaves a stale errored row, which the
//! next read treats as superseded.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::friend::{FriendClassifier, FriendMatch};
use crate::model::{KeyFormat, KeyId, KeyRecord, RedemptionOutcome, redact_key};
use crate::tabular::{self, Table};

/// Column order of every ledger file.
pub const LEDGER_HEADER: [&str; 7] = [
    "gamekey",
    "human_name",
    "redeemed_key_val",
    "recorded_at",
    "outcome",
    "reason",
    "confidence",
];

/// Columns of files written before timestamps and reasons were recorded.
const LEGACY_HEADER: [&str; 3] = ["gamekey", "human_name", "redeemed_key_val"];

pub const LOCK_FILE: &str = ".ledger.lock";

const LOCK_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Rows
// =============================================================================

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub gamekey: String,
    pub human_name: String,
    pub redeemed_key_val: String,
    /// Absent on rows read from legacy files
    pub recorded_at: Option<DateTime<Utc>>,
    pub outcome: RedemptionOutcome,
    pub reason: String,
    /// Friend classification confidence (0..=1), friend rows only
    pub confidence: Option<f64>,
}

impl LedgerRow {
    #[must_use]
    pub fn new(key: &KeyRecord, outcome: RedemptionOutcome, reason: impl Into<String>) -> Self {
        Self {
            gamekey: key.gamekey.trim().to_string(),
            human_name: key.name.trim().to_string(),
            redeemed_key_val: key.revealed().unwrap_or_default().to_string(),
            recorded_at: Some(Utc::now()),
            outcome,
            reason: reason.into(),
            confidence: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> KeyId {
        KeyId::new(&self.gamekey, &self.human_name)
    }

    /// Rebuild the key this row describes.
    #[must_use]
    pub fn to_key_record(&self) -> KeyRecord {
        let mut key = KeyRecord::new(self.gamekey.clone(), self.human_name.clone());
        if !self.redeemed_key_val.trim().is_empty() {
            key.revealed_key = Some(self.redeemed_key_val.clone());
        }
        key
    }

    fn fields(&self) -> [String; 7] {
        [
            self.gamekey.clone(),
            self.human_name.clone(),
            self.redeemed_key_val.clone(),
            self.recorded_at
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default(),
            self.outcome.to_string(),
            self.reason.clone(),
            self.confidence.map(|c| format!("{c:.2}")).unwrap_or_default(),
        ]
    }

    fn from_row(row: tabular::Row<'_>, file_outcome: RedemptionOutcome) -> Option<Self> {
        let gamekey = row.get(&["gamekey"]).trim();
        let human_name = row.get(&["human_name", "name"]).trim();
        if gamekey.is_empty() && human_name.is_empty() {
            return None;
        }
        let outcome = row
            .get(&["outcome"])
            .parse::<RedemptionOutcome>()
            .unwrap_or(file_outcome);
        Some(Self {
            gamekey: gamekey.to_string(),
            human_name: human_name.to_string(),
            redeemed_key_val: row.get(&["redeemed_key_val", "key"]).trim().to_string(),
            recorded_at: DateTime::parse_from_rfc3339(row.get(&["recorded_at"]).trim())
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            outcome,
            reason: row.get(&["reason"]).to_string(),
            confidence: parse_confidence(row.get(&["confidence"])),
        })
    }
}

/// Accepts `0.85` and the legacy `85%` form.
fn parse_confidence(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(pct) = raw.strip_suffix('%') {
        return pct.trim().parse::<f64>().ok().map(|p| p / 100.0);
    }
    raw.parse::<f64>().ok()
}

fn render(rows: &[LedgerRow]) -> String {
    let mut out = String::new();
    tabular::write_record(&mut out, &LEDGER_HEADER);
    for row in rows {
        tabular::write_record(&mut out, &row.fields());
    }
    out
}

// =============================================================================
// Results
// =============================================================================

/// Effect of a [`Ledger::record`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "outcome")]
pub enum RecordStatus {
    /// A new row was written
    Written,
    /// The identity already had this outcome; nothing changed
    Duplicate,
    /// The identity already holds a different terminal outcome, which is kept
    AlreadyTerminal(RedemptionOutcome),
    /// An errored row without a usable key gained one
    Upgraded,
}

/// Result of the offline errored-set cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub before: usize,
    pub after: usize,
    pub removed_superseded: usize,
    pub removed_duplicates: usize,
}

/// Row counts per outcome file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub redeemed: usize,
    pub already_owned: usize,
    pub errored: usize,
    pub expired: usize,
    pub friend: usize,
}

impl LedgerCounts {
    fn bump(&mut self, outcome: RedemptionOutcome, by: usize) {
        match outcome {
            RedemptionOutcome::Redeemed => self.redeemed += by,
            RedemptionOutcome::AlreadyOwned => self.already_owned += by,
            RedemptionOutcome::Errored => self.errored += by,
            RedemptionOutcome::Expired => self.expired += by,
            RedemptionOutcome::Friend => self.friend += by,
        }
    }
}

/// In-memory view of which identities hold which outcome.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    terminal: HashMap<KeyId, RedemptionOutcome>,
    errored: HashSet<KeyId>,
    counts: LedgerCounts,
}

impl LedgerSnapshot {
    #[must_use]
    pub fn terminal_outcome(&self, id: &KeyId) -> Option<RedemptionOutcome> {
        self.terminal.get(id).copied()
    }

    #[must_use]
    pub fn is_terminal(&self, id: &KeyId) -> bool {
        self.terminal.contains_key(id)
    }

    #[must_use]
    pub fn is_errored(&self, id: &KeyId) -> bool {
        self.errored.contains(id) && !self.terminal.contains_key(id)
    }

    #[must_use]
    pub fn contains(&self, outcome: RedemptionOutcome, id: &KeyId) -> bool {
        match outcome {
            RedemptionOutcome::Errored => self.is_errored(id),
            terminal => self.terminal_outcome(id) == Some(terminal),
        }
    }

    #[must_use]
    pub fn counts(&self) -> LedgerCounts {
        self.counts
    }

    /// Apply an outcome recorded after the snapshot was taken.
    pub fn note(&mut self, id: KeyId, outcome: RedemptionOutcome) {
        if self.terminal.contains_key(&id) {
            return;
        }
        if outcome.is_terminal() {
            if self.errored.remove(&id) {
                self.counts.errored = self.counts.errored.saturating_sub(1);
            }
            self.terminal.insert(id, outcome);
            self.counts.bump(outcome, 1);
        } else if self.errored.insert(id) {
            self.counts.errored += 1;
        }
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Exclusive advisory lock on the ledger directory. Released on drop.
///
/// Acquisition is blocking. While another process holds the lock, the wait
/// is moved off the async scheduler on a multi-threaded tokio runtime.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| lock_error(path, &e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_lock_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(LedgerError::Lock {
                            path: path.display().to_string(),
                            message: format!("still held after {}ms", timeout.as_millis()),
                        }
                        .into());
                    }
                    wait_for_lock();
                }
                Err(e) => return Err(lock_error(path, &e)),
            }
        }
    }
}

fn wait_for_lock() {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(LOCK_POLL));
        }
        _ => std::thread::sleep(LOCK_POLL),
    }
}

fn is_lock_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_error(path: &Path, e: &io::Error) -> crate::Error {
    LedgerError::Lock {
        path: path.display().to_string(),
        message: e.to_string(),
    }
    .into()
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "Failed to release ledger lock");
        }
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// File-backed outcome store. Cheap to clone; holds only paths and settings.
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
    redact_keys: bool,
    lock_timeout: Duration,
}

impl Ledger {
    /// Open (creating the directory if needed) the ledger in `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: &LedgerConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| LedgerError::Write {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            dir,
            redact_keys: config.redact_keys,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self, outcome: RedemptionOutcome) -> PathBuf {
        self.dir.join(outcome.file_name())
    }

    fn lock(&self) -> Result<LedgerLock> {
        LedgerLock::acquire(&self.dir.join(LOCK_FILE), self.lock_timeout)
    }

    fn read_file(&self, outcome: RedemptionOutcome) -> Result<Vec<LedgerRow>> {
        let path = self.path(outcome);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LedgerError::Read {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
                .into());
            }
        };
        let table = Table::parse_with_fallback(&text, "gamekey", &LEGACY_HEADER);
        Ok(table
            .rows()
            .filter_map(|row| LedgerRow::from_row(row, outcome))
            .map(|mut row| {
                row.outcome = outcome;
                row
            })
            .collect())
    }

    fn write_file(&self, outcome: RedemptionOutcome, rows: &[LedgerRow]) -> Result<()> {
        let path = self.path(outcome);
        let write_err = |e: io::Error| LedgerError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let tmp = path.with_extension("csv.tmp");
        {
            let mut file = File::create(&tmp).map_err(write_err)?;
            file.write_all(render(rows).as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }

    fn terminal_ids(&self) -> Result<HashMap<KeyId, RedemptionOutcome>> {
        let mut ids = HashMap::new();
        for outcome in RedemptionOutcome::TERMINAL {
            for row in self.read_file(outcome)? {
                ids.entry(row.id()).or_insert(outcome);
            }
        }
        Ok(ids)
    }

    /// Record `outcome` for `key`.
    pub fn record(
        &self,
        key: &KeyRecord,
        outcome: RedemptionOutcome,
        reason: &str,
    ) -> Result<RecordStatus> {
        self.record_row(LedgerRow::new(key, outcome, reason))
    }

    /// Record a friend key with its classification.
    pub fn record_friend(&self, key: &KeyRecord, friend: &FriendMatch) -> Result<RecordStatus> {
        let mut row = LedgerRow::new(key, RedemptionOutcome::Friend, friend.reason.clone());
        row.confidence = Some(friend.confidence);
        self.record_row(row)
    }

    fn record_row(&self, mut row: LedgerRow) -> Result<RecordStatus> {
        let _lock = self.lock()?;
        let id = row.id();
        let outcome = row.outcome;

        if let Some(existing) = self.terminal_ids()?.get(&id).copied() {
            self.remove_errored_locked(&id)?;
            return Ok(if existing == outcome {
                RecordStatus::Duplicate
            } else {
                RecordStatus::AlreadyTerminal(existing)
            });
        }

        if outcome == RedemptionOutcome::Errored {
            let mut rows = self.read_file(outcome)?;
            if let Some(existing) = rows.iter_mut().find(|r| r.id() == id) {
                if existing.redeemed_key_val.trim().is_empty() && !row.redeemed_key_val.is_empty() {
                    existing.redeemed_key_val = row.redeemed_key_val;
                    existing.reason = row.reason;
                    existing.recorded_at = row.recorded_at;
                    self.write_file(outcome, &rows)?;
                    return Ok(RecordStatus::Upgraded);
                }
                return Ok(RecordStatus::Duplicate);
            }
            rows.push(row);
            self.write_file(outcome, &rows)?;
            debug!(key = %id, "Recorded errored key");
            return Ok(RecordStatus::Written);
        }

        if self.redact_keys
            && matches!(
                outcome,
                RedemptionOutcome::Redeemed | RedemptionOutcome::AlreadyOwned
            )
        {
            row.redeemed_key_val = redact_key(&row.redeemed_key_val);
        }

        let mut rows = self.read_file(outcome)?;
        rows.push(row);
        self.write_file(outcome, &rows)?;
        self.remove_errored_locked(&id)?;
        debug!(key = %id, %outcome, "Recorded terminal outcome");
        Ok(RecordStatus::Written)
    }

    /// `PromoteFromErrored`: drop the identity's errored row. Returns whether
    /// a row was removed.
    pub fn promote_from_errored(&self, id: &KeyId) -> Result<bool> {
        let _lock = self.lock()?;
        self.remove_errored_locked(id)
    }

    fn remove_errored_locked(&self, id: &KeyId) -> Result<bool> {
        let rows = self.read_file(RedemptionOutcome::Errored)?;
        let before = rows.len();
        let kept: Vec<LedgerRow> = rows.into_iter().filter(|r| &r.id() != id).collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.write_file(RedemptionOutcome::Errored, &kept)?;
        Ok(true)
    }

    /// `LoadProblematic`: errored keys worth another attempt, in file order.
    ///
    /// Drops rows whose key is empty or rejected by `format`, rows already in
    /// a terminal file, and rows whose key value appears in the expired file.
    /// Duplicate identities collapse to one row, preferring an accepted key.
    pub fn load_problematic(&self, format: KeyFormat) -> Result<Vec<KeyRecord>> {
        let _lock = self.lock()?;
        let terminal = self.terminal_ids()?;
        let expired_keys: HashSet<String> = self
            .read_file(RedemptionOutcome::Expired)?
            .into_iter()
            .map(|r| r.redeemed_key_val.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        let rows = dedup_prefer_accepted(self.read_file(RedemptionOutcome::Errored)?, format).0;
        let queue: Vec<KeyRecord> = rows
            .into_iter()
            .filter(|row| {
                let key = row.redeemed_key_val.trim();
                format.accepts(key)
                    && !terminal.contains_key(&row.id())
                    && !expired_keys.contains(key)
            })
            .map(|row| row.to_key_record())
            .collect();
        debug!(count = queue.len(), "Loaded problematic keys");
        Ok(queue)
    }

    /// Offline dedup pass over the errored file.
    pub fn cleanup_errored(&self, format: KeyFormat) -> Result<CleanupReport> {
        let _lock = self.lock()?;
        let terminal = self.terminal_ids()?;
        let rows = self.read_file(RedemptionOutcome::Errored)?;
        let before = rows.len();

        let live: Vec<LedgerRow> = rows
            .into_iter()
            .filter(|r| !terminal.contains_key(&r.id()))
            .collect();
        let removed_superseded = before - live.len();
        let (kept, removed_duplicates) = dedup_prefer_accepted(live, format);

        let report = CleanupReport {
            before,
            after: kept.len(),
            removed_superseded,
            removed_duplicates,
        };
        if report.after != before {
            self.write_file(RedemptionOutcome::Errored, &kept)?;
        }
        info!(
            before = report.before,
            after = report.after,
            superseded = report.removed_superseded,
            duplicates = report.removed_duplicates,
            "Errored ledger cleaned"
        );
        Ok(report)
    }

    /// Move errored rows whose title is a friend key into the friend file.
    pub fn promote_friend_keys_from_errored(
        &self,
        classifier: &FriendClassifier,
    ) -> Result<Vec<LedgerRow>> {
        let _lock = self.lock()?;
        let errored = self.read_file(RedemptionOutcome::Errored)?;
        let mut friends = self.read_file(RedemptionOutcome::Friend)?;
        let mut friend_ids: HashSet<KeyId> = friends.iter().map(LedgerRow::id).collect();

        let mut moved = Vec::new();
        let mut kept = Vec::with_capacity(errored.len());
        for row in errored {
            let matched = classifier
                .classify(&row.to_key_record())
                .filter(|m| m.confidence >= classifier.auto_threshold());
            match matched {
                Some(m) => {
                    if friend_ids.insert(row.id()) {
                        let promoted = LedgerRow {
                            outcome: RedemptionOutcome::Friend,
                            reason: m.reason,
                            confidence: Some(m.confidence),
                            recorded_at: Some(Utc::now()),
                            ..row
                        };
                        friends.push(promoted.clone());
                        moved.push(promoted);
                    }
                }
                None => kept.push(row),
            }
        }

        if !moved.is_empty() {
            self.write_file(RedemptionOutcome::Friend, &friends)?;
            self.write_file(RedemptionOutcome::Errored, &kept)?;
            info!(count = moved.len(), "Moved friend keys out of the errored ledger");
        }
        Ok(moved)
    }

    /// Outcome membership for every identity in the ledger.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        let _lock = self.lock()?;
        let mut snapshot = LedgerSnapshot::default();
        for outcome in RedemptionOutcome::TERMINAL {
            let rows = self.read_file(outcome)?;
            snapshot.counts.bump(outcome, rows.len());
            for row in rows {
                snapshot.terminal.entry(row.id()).or_insert(outcome);
            }
        }
        let errored = self.read_file(RedemptionOutcome::Errored)?;
        snapshot.counts.errored = errored.len();
        snapshot.errored = errored.iter().map(LedgerRow::id).collect();
        Ok(snapshot)
    }

    /// All rows of one outcome file, in file order.
    pub fn rows(&self, outcome: RedemptionOutcome) -> Result<Vec<LedgerRow>> {
        let _lock = self.lock()?;
        self.read_file(outcome)
    }

    /// Row counts keyed by outcome label.
    pub fn counts_by_outcome(&self) -> Result<BTreeMap<RedemptionOutcome, usize>> {
        let _lock = self.lock()?;
        let mut counts = BTreeMap::new();
        for outcome in RedemptionOutcome::ALL {
            counts.insert(outcome, self.read_file(outcome)?.len());
        }
        Ok(counts)
    }
}

/// Keep the first row per identity, replacing it in place with a later row
/// when only the later one carries an accepted key. Returns the rows and the
/// number removed.
fn dedup_prefer_accepted(rows: Vec<LedgerRow>, format: KeyFormat) -> (Vec<LedgerRow>, usize) {
    let total = rows.len();
    let mut index: HashMap<KeyId, usize> = HashMap::new();
    let mut out: Vec<LedgerRow> = Vec::with_capacity(total);
    for row in rows {
        match index.get(&row.id()) {
            Some(&i) => {
                if !format.accepts(&out[i].redeemed_key_val) && format.accepts(&row.redeemed_key_val)
                {
                    out[i] = row;
                }
            }
            None => {
                index.insert(row.id(), out.len());
                out.push(row);
            }
        }
    }
    let removed = total - out.len();
    (out, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &Path) -> Ledger {
        Ledger::open(dir, &LedgerConfig::default()).unwrap()
    }

    fn key(gamekey: &str, name: &str, value: &str) -> KeyRecord {
        KeyRecord::new(gamekey, name).with_key(value)
    }

    #[test]
    fn terminal_record_removes_errored_row() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        let k = key("bundle42", "Game A", "ABCD-1234");

        assert_eq!(
            ledger.record(&k, RedemptionOutcome::Errored, "transient").unwrap(),
            RecordStatus::Written
        );
        assert_eq!(
            ledger.record(&k, RedemptionOutcome::Redeemed, "").unwrap(),
            RecordStatus::Written
        );

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap.terminal_outcome(&k.id()), Some(RedemptionOutcome::Redeemed));
        assert!(!snap.is_errored(&k.id()));
        assert!(ledger.rows(RedemptionOutcome::Errored).unwrap().is_empty());
    }

    #[test]
    fn terminal_outcome_is_never_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        let k = key("g", "Game", "ABCDE-12345-FGHIJ");

        ledger.record(&k, RedemptionOutcome::Redeemed, "").unwrap();
        assert_eq!(
            ledger.record(&k, RedemptionOutcome::Redeemed, "").unwrap(),
            RecordStatus::Duplicate
        );
        assert_eq!(
            ledger.record(&k, RedemptionOutcome::AlreadyOwned, "").unwrap(),
            RecordStatus::AlreadyTerminal(RedemptionOutcome::Redeemed)
        );
        assert_eq!(
            ledger.record(&k, RedemptionOutcome::Errored, "late").unwrap(),
            RecordStatus::AlreadyTerminal(RedemptionOutcome::Redeemed)
        );
        assert_eq!(ledger.rows(RedemptionOutcome::Redeemed).unwrap().len(), 1);
        assert!(ledger.rows(RedemptionOutcome::AlreadyOwned).unwrap().is_empty());
        assert!(ledger.rows(RedemptionOutcome::Errored).unwrap().is_empty());
    }

    #[test]
    fn shared_gamekey_titles_are_independent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        let a = key("month", "Title One", "AAAAA-11111-AAAAA");
        let b = key("month", "Title Two", "BBBBB-22222-BBBBB");

        ledger.record(&a, RedemptionOutcome::Errored, "x").unwrap();
        ledger.record(&b, RedemptionOutcome::Errored, "x").unwrap();
        ledger.record(&a, RedemptionOutcome::Redeemed, "").unwrap();

        let errored = ledger.rows(RedemptionOutcome::Errored).unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].human_name, "Title Two");
    }

    #[test]
    fn errored_row_upgrades_empty_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        let blank = KeyRecord::new("g", "Game");
        ledger.record(&blank, RedemptionOutcome::Errored, "reveal failed").unwrap();
        assert_eq!(
            ledger.record(&blank, RedemptionOutcome::Errored, "again").unwrap(),
            RecordStatus::Duplicate
        );
        assert_eq!(
            ledger
                .record(&key("g", "Game", "KEY-1"), RedemptionOutcome::Errored, "retry")
                .unwrap(),
            RecordStatus::Upgraded
        );
        let rows = ledger.rows(RedemptionOutcome::Errored).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].redeemed_key_val, "KEY-1");
    }

    #[test]
    fn problematic_filtering() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        ledger
            .record(&KeyRecord::new("g1", "Empty Key"), RedemptionOutcome::Errored, "")
            .unwrap();
        ledger
            .record(&key("g2", "Old Key", "OLDKY-00000-OLDKY"), RedemptionOutcome::Errored, "")
            .unwrap();
        ledger
            .record(&key("g9", "Other Listing", "OLDKY-00000-OLDKY"), RedemptionOutcome::Expired, "")
            .unwrap();
        ledger
            .record(&key("g3", "Marker", "EXPIRED"), RedemptionOutcome::Errored, "")
            .unwrap();
        ledger
            .record(&key("g4", "Good Key", "GOODK-12345-GOODK"), RedemptionOutcome::Errored, "")
            .unwrap();

        let queue = ledger.load_problematic(KeyFormat::Lenient).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].gamekey, "g4");
        assert_eq!(queue[0].revealed(), Some("GOODK-12345-GOODK"));
    }

    #[test]
    fn problematic_respects_platform_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        ledger
            .record(&key("g", "Short", "ABCD-1234"), RedemptionOutcome::Errored, "")
            .unwrap();
        assert_eq!(ledger.load_problematic(KeyFormat::Lenient).unwrap().len(), 1);
        assert!(ledger.load_problematic(KeyFormat::Platform).unwrap().is_empty());
    }

    #[test]
    fn legacy_headerless_file_is_read_and_deduped() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("errored.csv"),
            "g1,Game One,\ng1,Game One,AAAAA-11111-AAAAA\ng2,Game Two,BBBBB-22222-BBBBB\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("redeemed.csv"),
            "gamekey,human_name,redeemed_key_val\ng2,Game Two,BBBBB-22222-BBBBB\n",
        )
        .unwrap();
        let ledger = ledger(tmp.path());

        let queue = ledger.load_problematic(KeyFormat::Lenient).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].name, "Game One");
        assert_eq!(queue[0].revealed(), Some("AAAAA-11111-AAAAA"));

        let report = ledger.cleanup_errored(KeyFormat::Lenient).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                before: 3,
                after: 1,
                removed_superseded: 1,
                removed_duplicates: 1,
            }
        );
        let text = std::fs::read_to_string(tmp.path().join("errored.csv")).unwrap();
        assert!(text.starts_with("gamekey,human_name,redeemed_key_val,recorded_at"));
        assert!(text.contains("AAAAA-11111-AAAAA"));
    }

    #[test]
    fn legacy_friend_file_columns_are_mapped() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("friend_keys.csv"),
            "human_name,key_type,redeemed_key_val,gamekey,steam_app_id,reason,confidence\n\
             Guest Pass,Steam,KEY,gk,,human_name contains 'guest pass',100%\n",
        )
        .unwrap();
        let ledger = ledger(tmp.path());
        let rows = ledger.rows(RedemptionOutcome::Friend).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gamekey, "gk");
        assert_eq!(rows[0].confidence, Some(1.0));
        assert!(ledger.snapshot().unwrap().is_terminal(&KeyId::new("gk", "guest pass")));
    }

    #[test]
    fn promotes_friend_keys_out_of_errored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        ledger
            .record(&key("g", "Shooter Guest Pass", "K-1"), RedemptionOutcome::Errored, "")
            .unwrap();
        ledger
            .record(&key("g", "Regular Game", "K-2"), RedemptionOutcome::Errored, "")
            .unwrap();

        let classifier = FriendClassifier::new(0.8).unwrap();
        let moved = ledger.promote_friend_keys_from_errored(&classifier).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].confidence, Some(1.0));

        let friends = ledger.rows(RedemptionOutcome::Friend).unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].redeemed_key_val, "K-1");
        let errored = ledger.rows(RedemptionOutcome::Errored).unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].human_name, "Regular Game");
    }

    #[test]
    fn redaction_applies_to_redeemed_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = LedgerConfig {
            redact_keys: true,
            ..LedgerConfig::default()
        };
        let ledger = Ledger::open(tmp.path(), &config).unwrap();
        ledger
            .record(&key("g", "A", "ABCDE-12345-FGHIJ"), RedemptionOutcome::Redeemed, "")
            .unwrap();
        ledger
            .record(&key("g", "B", "ZZZZZ-12345-FGHIJ"), RedemptionOutcome::Expired, "")
            .unwrap();
        assert_eq!(
            ledger.rows(RedemptionOutcome::Redeemed).unwrap()[0].redeemed_key_val,
            "ABCDE-*****-*****"
        );
        assert_eq!(
            ledger.rows(RedemptionOutcome::Expired).unwrap()[0].redeemed_key_val,
            "ZZZZZ-12345-FGHIJ"
        );
    }

    #[test]
    fn quoted_titles_survive_rewrite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = ledger(tmp.path());
        let k = key("g", "Hello, \"World\"", "KEY");
        ledger.record(&k, RedemptionOutcome::Redeemed, "").unwrap();
        ledger
            .record(&key("g", "Second", "KEY2"), RedemptionOutcome::Redeemed, "")
            .unwrap();
        let rows = ledger.rows(RedemptionOutcome::Redeemed).unwrap();
        assert_eq!(rows[0].human_name, "Hello, \"World\"");
        assert!(rows[0].recorded_at.is_some());
    }

    #[test]
    fn snapshot_note_tracks_new_outcomes() {
        let mut snap = LedgerSnapshot::default();
        let id = KeyId::new("g", "n");
        snap.note(id.clone(), RedemptionOutcome::Errored);
        assert!(snap.is_errored(&id));
        assert_eq!(snap.counts().errored, 1);
        snap.note(id.clone(), RedemptionOutcome::Redeemed);
        assert!(!snap.is_errored(&id));
        assert_eq!(snap.counts().errored, 0);
        assert_eq!(snap.counts().redeemed, 1);
        snap.note(id.clone(), RedemptionOutcome::AlreadyOwned);
        assert_eq!(snap.terminal_outcome(&id), Some(RedemptionOutcome::Redeemed));
    }

    #[test]
    fn lock_times_out_when_held() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = LedgerConfig {
            lock_timeout_ms: 100,
            ..LedgerConfig::default()
        };
        let ledger = Ledger::open(tmp.path(), &config).unwrap();
        let held = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(tmp.path().join(LOCK_FILE))
            .unwrap();
        FileExt::lock_exclusive(&held).unwrap();

        let err = ledger.snapshot().unwrap_err();
        assert!(matches!(err, crate::Error::Ledger(LedgerError::Lock { .. })));
        FileExt::unlock(&held).unwrap();
        assert!(ledger.snapshot().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn contended_lock_inside_runtime_waits_for_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path(), &LedgerConfig::default()).unwrap();
        let held = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(tmp.path().join(LOCK_FILE))
            .unwrap();
        FileExt::lock_exclusive(&held).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            FileExt::unlock(&held).unwrap();
        });
        let status = ledger
            .record(
                &KeyRecord::new("g1", "Game A").with_key("AAAAA-BBBBB-CCCCC"),
                RedemptionOutcome::Redeemed,
                "redeemed",
            )
            .unwrap();
        assert_eq!(status, RecordStatus::Written);
        release.await.unwrap();
        assert_eq!(ledger.snapshot().unwrap().counts().redeemed, 1);
    }
}
