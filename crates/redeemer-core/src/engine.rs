//! Run orchestration.
//!
//! One run loads the key batch, classifies every key (completed bundle,
//! already terminal, friend, ownership), then redeems in two passes: fresh
//! keys first, then the ledger's problematic keys. Redemption is strictly
//! sequential. The catalog is only loaded when some key needs an ownership
//! decision.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogCache, CatalogSource};
use crate::completion::CompletionTracker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::friend::{FriendClassifier, FriendMatch};
use crate::ledger::{Ledger, LedgerSnapshot, RecordStatus};
use crate::model::{KeyId, KeyRecord, OwnershipDecision, RedemptionOutcome};
use crate::redemption::{KeySource, PlatformRedeemer, RedemptionMachine, Shutdown, SourceBatch};
use crate::resolver::{OwnershipResolver, Resolution};

/// External services the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogSource>,
    pub redeemer: Arc<dyn PlatformRedeemer>,
    pub keys: Arc<dyn KeySource>,
}

// =============================================================================
// Classification
// =============================================================================

/// What a run does with one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Disposition {
    /// The key's bundle is recorded complete
    CompletedBundle,
    AlreadyTerminal { outcome: RedemptionOutcome },
    /// Choice slot with no key selected yet
    Unclaimed,
    /// Key targets another platform
    OtherPlatform,
    Expired,
    Friend { friend: FriendMatch },
    /// Unowned but already errored; retried in the problematic pass
    Deferred { resolution: Resolution },
    Owned { resolution: Resolution },
    Unknown { resolution: Resolution },
    Redeem { resolution: Resolution },
}

/// A key with its planned disposition.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedKey {
    pub gamekey: String,
    pub title: String,
    #[serde(skip)]
    pub key: KeyRecord,
    #[serde(flatten)]
    pub disposition: Disposition,
    /// Friend match below the automatic threshold, reported for review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertain_friend: Option<FriendMatch>,
}

/// Classification of a batch without side effects on the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub keys: Vec<ClassifiedKey>,
    /// Titles queued for the problematic pass
    pub problematic: Vec<String>,
    pub source_failures: Vec<String>,
}

impl RunPlan {
    /// Number of keys per disposition label.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.keys {
            *counts.entry(item.disposition.label()).or_insert(0) += 1;
        }
        counts
    }
}

impl Disposition {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::CompletedBundle => "completed_bundle",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::Unclaimed => "unclaimed",
            Self::OtherPlatform => "other_platform",
            Self::Expired => "expired",
            Self::Friend { .. } => "friend",
            Self::Deferred { .. } => "deferred",
            Self::Owned { .. } => "owned",
            Self::Unknown { .. } => "unknown",
            Self::Redeem { .. } => "redeem",
        }
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Machine-readable result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub redeemed: usize,
    pub already_owned: usize,
    pub errored: usize,
    pub expired: usize,
    pub friend: usize,
    /// OWNED at classification
    pub owned_skipped: usize,
    /// UNKNOWN and not attempted
    pub unknown: usize,
    pub uncertain_friend: usize,
    pub skipped_terminal: usize,
    pub skipped_bundles: usize,
    pub source_failures: usize,
    pub problematic_attempted: usize,
    pub rate_limit_events: u32,
    pub rate_limit_wait_secs: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub unknown_titles: Vec<String>,
    pub completed_bundles: Vec<String>,
}

impl RunSummary {
    fn started() -> Self {
        Self {
            redeemed: 0,
            already_owned: 0,
            errored: 0,
            expired: 0,
            friend: 0,
            owned_skipped: 0,
            unknown: 0,
            uncertain_friend: 0,
            skipped_terminal: 0,
            skipped_bundles: 0,
            source_failures: 0,
            problematic_attempted: 0,
            rate_limit_events: 0,
            rate_limit_wait_secs: 0,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
            unknown_titles: Vec::new(),
            completed_bundles: Vec::new(),
        }
    }

    fn bump(&mut self, outcome: RedemptionOutcome) {
        match outcome {
            RedemptionOutcome::Redeemed => self.redeemed += 1,
            RedemptionOutcome::AlreadyOwned => self.already_owned += 1,
            RedemptionOutcome::Errored => self.errored += 1,
            RedemptionOutcome::Expired => self.expired += 1,
            RedemptionOutcome::Friend => self.friend += 1,
        }
    }

    /// Count for one outcome.
    #[must_use]
    pub fn count(&self, outcome: RedemptionOutcome) -> usize {
        match outcome {
            RedemptionOutcome::Redeemed => self.redeemed,
            RedemptionOutcome::AlreadyOwned => self.already_owned,
            RedemptionOutcome::Errored => self.errored,
            RedemptionOutcome::Expired => self.expired,
            RedemptionOutcome::Friend => self.friend,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Ownership resolution and redemption reconciliation over explicit stores.
pub struct Engine {
    config: Config,
    ledger: Ledger,
    cache: CatalogCache,
    classifier: Option<FriendClassifier>,
    resolver: OwnershipResolver,
    collaborators: Collaborators,
    user_id: String,
}

impl Engine {
    /// Open the ledger and catalog cache under the configured directories.
    pub fn new(config: Config, collaborators: Collaborators, user_id: impl Into<String>) -> Result<Self> {
        let ledger = Ledger::open(&config.general.data_dir, &config.ledger)?;
        let cache = CatalogCache::new(config.cache_path(), config.catalog.clone());
        let classifier = if config.friend.enabled {
            Some(FriendClassifier::load(
                &config.friend_patterns_path(),
                config.friend.auto_threshold,
            )?)
        } else {
            None
        };
        let resolver = OwnershipResolver::new(config.matching.clone());
        Ok(Self {
            config,
            ledger,
            cache,
            classifier,
            resolver,
            collaborators,
            user_id: user_id.into(),
        })
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Classify the current batch and list the problematic queue. Writes no
    /// ledger rows.
    pub async fn plan(&self) -> Result<RunPlan> {
        let batch = self.collaborators.keys.load().await?;
        let snapshot = self.ledger.snapshot()?;
        let completion = CompletionTracker::open(self.ledger.dir());
        let keys = self.classify(&batch, &snapshot, &completion).await?;
        let problematic = self
            .ledger
            .load_problematic(self.config.redemption.key_format)?
            .into_iter()
            .map(|k| k.name)
            .collect();
        Ok(RunPlan {
            keys,
            problematic,
            source_failures: batch.failures,
        })
    }

    /// Run the full pipeline. A shutdown request ends the run early with
    /// `cancelled = true`; session loss and ledger failures are errors.
    pub async fn run(&self, shutdown: Shutdown) -> Result<RunSummary> {
        let mut summary = RunSummary::started();

        let batch = self.collaborators.keys.load().await?;
        for failure in &batch.failures {
            warn!(failure = %failure, "Key source item skipped");
        }
        summary.source_failures = batch.failures.len();
        info!(
            keys = batch.keys.len(),
            bundles = batch.bundles.len(),
            "Loaded key batch"
        );

        if let Some(classifier) = &self.classifier {
            summary.friend += self
                .ledger
                .promote_friend_keys_from_errored(classifier)?
                .len();
        }

        let mut snapshot = self.ledger.snapshot()?;
        let mut completion = CompletionTracker::open(self.ledger.dir());
        let classified = self.classify(&batch, &snapshot, &completion).await?;

        let mut skipped_bundles = BTreeSet::new();
        let mut held_back: HashSet<KeyId> = HashSet::new();
        let mut fresh = Vec::new();
        for item in classified {
            if let Some(friend) = &item.uncertain_friend {
                summary.uncertain_friend += 1;
                info!(
                    gamekey = %item.gamekey,
                    title = %item.title,
                    confidence = friend.confidence,
                    reason = %friend.reason,
                    "Possible friend key, not excluded"
                );
            }
            match item.disposition {
                Disposition::CompletedBundle => {
                    if let Some(bundle) = &item.key.bundle_month {
                        skipped_bundles.insert(bundle.clone());
                    }
                }
                Disposition::AlreadyTerminal { .. } => summary.skipped_terminal += 1,
                Disposition::Unclaimed | Disposition::OtherPlatform => {
                    debug!(gamekey = %item.gamekey, title = %item.title, "Not redeemable");
                }
                Disposition::Expired => {
                    self.record(
                        &mut snapshot,
                        &mut summary,
                        &item.key,
                        RedemptionOutcome::Expired,
                        "key source reports expired",
                    )?;
                }
                Disposition::Friend { friend } => {
                    let status = self.ledger.record_friend(&item.key, &friend)?;
                    self.note(&mut snapshot, &mut summary, &item.key, RedemptionOutcome::Friend, status);
                    info!(
                        gamekey = %item.gamekey,
                        title = %item.title,
                        outcome = %RedemptionOutcome::Friend,
                        reason = %friend.reason,
                        "Key classified"
                    );
                }
                Disposition::Deferred { .. } => {
                    // Refresh an errored row that has no key yet.
                    if item.key.is_revealed() {
                        self.ledger
                            .record(&item.key, RedemptionOutcome::Errored, "carried over")?;
                    }
                }
                Disposition::Owned { resolution } => {
                    summary.owned_skipped += 1;
                    if self.config.redemption.record_owned_as_already_owned {
                        let reason = owned_reason(&resolution);
                        self.record(
                            &mut snapshot,
                            &mut summary,
                            &item.key,
                            RedemptionOutcome::AlreadyOwned,
                            &reason,
                        )?;
                    }
                }
                Disposition::Unknown { .. } => {
                    held_back.insert(item.key.id());
                    summary.unknown += 1;
                    info!(
                        gamekey = %item.gamekey,
                        title = %item.title,
                        "No confident catalog match, not redeeming"
                    );
                    summary.unknown_titles.push(item.title);
                }
                Disposition::Redeem { .. } => fresh.push(item.key),
            }
        }
        summary.skipped_bundles = skipped_bundles.len();

        let mut machine = RedemptionMachine::new(
            Arc::clone(&self.collaborators.redeemer),
            Arc::clone(&self.collaborators.keys),
            self.config.redemption.clone(),
            shutdown.clone(),
        );

        let mut attempted: HashSet<KeyId> = HashSet::new();
        let finished = self
            .drain(&fresh, &mut machine, &mut snapshot, &mut summary, &mut attempted)
            .await?;

        if finished && !shutdown.is_triggered() {
            let problematic: Vec<KeyRecord> = self
                .ledger
                .load_problematic(self.config.redemption.key_format)?
                .into_iter()
                .filter(|k| !attempted.contains(&k.id()) && !held_back.contains(&k.id()))
                .map(|k| with_batch_details(k, &batch))
                .collect();
            if !problematic.is_empty() {
                info!(count = problematic.len(), "Retrying problematic keys");
            }
            let before = attempted.len();
            let finished = self
                .drain(&problematic, &mut machine, &mut snapshot, &mut summary, &mut attempted)
                .await?;
            summary.problematic_attempted = attempted.len() - before;
            summary.cancelled = !finished;
        } else {
            summary.cancelled = true;
        }

        summary.completed_bundles = self.update_completion(&batch, &snapshot, &mut completion)?;

        let stats = machine.stats();
        summary.rate_limit_events = stats.rate_limit_events;
        summary.rate_limit_wait_secs = stats.rate_limit_wait.as_secs();
        summary.finished_at = Some(Utc::now());
        info!(
            redeemed = summary.redeemed,
            already_owned = summary.already_owned,
            errored = summary.errored,
            expired = summary.expired,
            friend = summary.friend,
            unknown = summary.unknown,
            cancelled = summary.cancelled,
            "Run finished"
        );
        Ok(summary)
    }

    /// Redeem `queue` in order. Returns false when the run was cancelled.
    async fn drain(
        &self,
        queue: &[KeyRecord],
        machine: &mut RedemptionMachine,
        snapshot: &mut LedgerSnapshot,
        summary: &mut RunSummary,
        attempted: &mut HashSet<KeyId>,
    ) -> Result<bool> {
        if queue.is_empty() {
            return Ok(true);
        }
        match self.collaborators.redeemer.keep_alive().await {
            Ok(()) => {}
            Err(e) if e.needs_manual_login() => return Err(e),
            Err(e) => warn!(error = %e, "Platform session check failed; continuing"),
        }

        for key in queue {
            if snapshot.is_terminal(&key.id()) {
                summary.skipped_terminal += 1;
                continue;
            }
            let verdict = match machine.process(key).await {
                Ok(verdict) => verdict,
                Err(Error::Cancelled(reason)) => {
                    info!(%reason, "Run cancelled");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            attempted.insert(key.id());
            self.record(snapshot, summary, &verdict.key, verdict.outcome, &verdict.reason)?;
            info!(
                gamekey = %key.gamekey,
                title = %key.name,
                outcome = %verdict.outcome,
                reason = %verdict.reason,
                attempt = verdict.attempts,
                "Key processed"
            );
        }
        Ok(true)
    }

    fn record(
        &self,
        snapshot: &mut LedgerSnapshot,
        summary: &mut RunSummary,
        key: &KeyRecord,
        outcome: RedemptionOutcome,
        reason: &str,
    ) -> Result<()> {
        let status = self.ledger.record(key, outcome, reason)?;
        self.note(snapshot, summary, key, outcome, status);
        Ok(())
    }

    fn note(
        &self,
        snapshot: &mut LedgerSnapshot,
        summary: &mut RunSummary,
        key: &KeyRecord,
        outcome: RedemptionOutcome,
        status: RecordStatus,
    ) {
        match status {
            RecordStatus::Written | RecordStatus::Upgraded => {
                snapshot.note(key.id(), outcome);
                summary.bump(outcome);
            }
            RecordStatus::Duplicate => {
                if outcome == RedemptionOutcome::Errored {
                    summary.bump(outcome);
                }
            }
            RecordStatus::AlreadyTerminal(existing) => {
                debug!(gamekey = %key.gamekey, title = %key.name, %existing, "Kept existing outcome");
                snapshot.note(key.id(), existing);
            }
        }
    }

    async fn classify(
        &self,
        batch: &SourceBatch,
        snapshot: &LedgerSnapshot,
        completion: &CompletionTracker,
    ) -> Result<Vec<ClassifiedKey>> {
        let mut staged = Vec::with_capacity(batch.keys.len());
        let mut needs_catalog = false;
        for key in &batch.keys {
            let (disposition, uncertain) = self.pre_classify(key, snapshot, completion);
            needs_catalog |= disposition.is_none();
            staged.push((key, disposition, uncertain));
        }

        let catalog = if needs_catalog {
            self.cache
                .load_or_build(self.collaborators.catalog.as_ref(), &self.user_id)
                .await?
        } else {
            Catalog::default()
        };

        Ok(staged
            .into_iter()
            .map(|(key, disposition, uncertain_friend)| ClassifiedKey {
                gamekey: key.gamekey.clone(),
                title: key.name.clone(),
                key: key.clone(),
                disposition: disposition.unwrap_or_else(|| self.decide(key, &catalog, snapshot)),
                uncertain_friend,
            })
            .collect())
    }

    /// Everything decidable without the catalog. `None` means the key needs
    /// an ownership decision.
    fn pre_classify(
        &self,
        key: &KeyRecord,
        snapshot: &LedgerSnapshot,
        completion: &CompletionTracker,
    ) -> (Option<Disposition>, Option<FriendMatch>) {
        if key
            .bundle_month
            .as_deref()
            .is_some_and(|b| completion.is_complete(b))
        {
            return (Some(Disposition::CompletedBundle), None);
        }
        if let Some(outcome) = snapshot.terminal_outcome(&key.id()) {
            return (Some(Disposition::AlreadyTerminal { outcome }), None);
        }
        if key.is_choice_unclaimed {
            return (Some(Disposition::Unclaimed), None);
        }
        if !key.targets_platform() {
            return (Some(Disposition::OtherPlatform), None);
        }
        if key.expired {
            return (Some(Disposition::Expired), None);
        }

        let mut uncertain = None;
        if let Some(classifier) = &self.classifier {
            if let Some(friend) = classifier.classify(key) {
                if friend.confidence >= self.config.friend.auto_threshold {
                    return (Some(Disposition::Friend { friend }), None);
                }
                if friend.confidence >= self.config.friend.review_threshold {
                    uncertain = Some(friend);
                }
            }
        }

        (None, uncertain)
    }

    fn decide(&self, key: &KeyRecord, catalog: &Catalog, snapshot: &LedgerSnapshot) -> Disposition {
        let resolution = self.resolver.resolve(key, catalog);
        debug!(
            gamekey = %key.gamekey,
            title = %key.name,
            decision = %resolution.decision,
            app_id = ?resolution.app_id,
            score = resolution.score,
            "Ownership resolved"
        );
        let redeemable = match resolution.decision {
            OwnershipDecision::Owned => return Disposition::Owned { resolution },
            OwnershipDecision::Unowned => true,
            OwnershipDecision::Unknown => self.config.matching.redeem_unknown,
        };
        if !redeemable {
            Disposition::Unknown { resolution }
        } else if snapshot.is_errored(&key.id()) {
            Disposition::Deferred { resolution }
        } else {
            Disposition::Redeem { resolution }
        }
    }

    /// Mark every bundle in the batch whose keys are all selected and
    /// terminal. Returns the newly completed bundles.
    fn update_completion(
        &self,
        batch: &SourceBatch,
        snapshot: &LedgerSnapshot,
        completion: &mut CompletionTracker,
    ) -> Result<Vec<String>> {
        let mut by_bundle: BTreeMap<&str, Vec<&KeyRecord>> = BTreeMap::new();
        // Keys for other platforms never reach the ledger, so they cannot
        // hold a bundle open.
        for key in batch.keys.iter().filter(|k| k.targets_platform()) {
            if let Some(bundle) = key.bundle_month.as_deref() {
                by_bundle.entry(bundle).or_default().push(key);
            }
        }
        let unselected: HashSet<&str> = batch
            .bundles
            .iter()
            .filter(|b| b.unclaimed_choices > 0)
            .map(|b| b.id.as_str())
            .collect();

        let mut newly = Vec::new();
        for (bundle, keys) in by_bundle {
            if completion.is_complete(bundle) || unselected.contains(bundle) {
                continue;
            }
            if CompletionTracker::evaluate(bundle, &keys, snapshot)
                && completion.mark_complete(bundle)?
            {
                info!(bundle, "Bundle complete");
                newly.push(bundle.to_string());
            }
        }
        Ok(newly)
    }
}

fn owned_reason(resolution: &Resolution) -> String {
    match (&resolution.matched_name, resolution.app_id) {
        (Some(name), Some(app_id)) => format!("owned: {name} (app {app_id})"),
        (None, Some(app_id)) => format!("owned: app {app_id}"),
        _ => "owned".to_string(),
    }
}

/// Prefer the batch's copy of a problematic key, which carries bundle and
/// source fields the ledger does not store.
fn with_batch_details(key: KeyRecord, batch: &SourceBatch) -> KeyRecord {
    let id = key.id();
    match batch.keys.iter().find(|k| k.id() == id) {
        Some(fresh) => {
            let mut merged = fresh.clone();
            if !merged.is_revealed() {
                merged.revealed_key = key.revealed_key;
            }
            merged
        }
        None => key,
    }
}
