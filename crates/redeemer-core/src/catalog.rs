//! Platform catalog and owned-app cache.
//!
//! The full app listing and the user's owned set are fetched through a
//! [`CatalogSource`] and cached on disk as checksummed envelopes. A cache file
//! whose SHA-256 does not match its payload is discarded whole and rebuilt;
//! nothing from it is reused. Expired files are rebuilt on next use.
//!
//! Owned apps missing from the bulk listing are backfilled with bounded
//! concurrent detail lookups. Individual lookup failures are logged and
//! skipped; results are merged only after every lookup has finished.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};
use crate::model::CatalogEntry;
use crate::retry::{RetryPolicy, with_retry};
use crate::similarity::{normalize_title, strip_platform_suffix, tokens};

/// On-disk cache format version.
pub const CACHE_VERSION: u32 = 1;

/// Upper bound on catalog entries scored for one title.
const MAX_CANDIDATES: usize = 2_000;

pub const CATALOG_FILE: &str = "catalog.json";
pub const DETAILS_FILE: &str = "app_details.json";

// =============================================================================
// Collaborator contract
// =============================================================================

/// One page of the platform app listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppPage {
    pub apps: Vec<CatalogEntry>,
    /// Cursor for the next page; `None` on the last page
    pub next_cursor: Option<u32>,
}

/// The user's owned apps and packages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedApps {
    pub app_ids: Vec<u32>,
    #[serde(default)]
    pub package_ids: Vec<u32>,
}

impl OwnedApps {
    fn normalized(mut self) -> Self {
        self.app_ids.sort_unstable();
        self.app_ids.dedup();
        self.package_ids.sort_unstable();
        self.package_ids.dedup();
        self
    }
}

/// Paginated catalog listing, per-app detail and owned-app lookups.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the listing page starting after `cursor` (`None` for the first page).
    async fn list_apps(&self, cursor: Option<u32>) -> Result<AppPage>;

    /// Look up a single app. `Ok(None)` when the platform has no record of it.
    async fn app_detail(&self, app_id: u32) -> Result<Option<CatalogEntry>>;

    /// Fetch the owned set for `user_id`.
    async fn owned_apps(&self, user_id: &str) -> Result<OwnedApps>;
}

// =============================================================================
// In-memory catalog
// =============================================================================

/// Name index plus owned set, as consumed by the resolver.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    names: HashMap<u32, String>,
    by_name: HashMap<String, Vec<u32>>,
    owned: HashSet<u32>,
    token_index: HashMap<String, Vec<u32>>,
}

impl Catalog {
    /// Build a catalog from entries and owned app ids. Later entries for the
    /// same app id replace earlier ones.
    pub fn from_parts(
        entries: impl IntoIterator<Item = CatalogEntry>,
        owned: impl IntoIterator<Item = u32>,
    ) -> Self {
        let mut names: BTreeMap<u32, String> = BTreeMap::new();
        for entry in entries {
            if entry.canonical_name.trim().is_empty() {
                continue;
            }
            names.insert(entry.app_id, entry.canonical_name);
        }

        let mut by_name: HashMap<String, Vec<u32>> = HashMap::new();
        let mut token_index: HashMap<String, Vec<u32>> = HashMap::new();
        for (&app_id, name) in &names {
            by_name.entry(normalize_title(name)).or_default().push(app_id);
            let mut seen = HashSet::new();
            for token in tokens(&strip_platform_suffix(name)) {
                if seen.insert(token.clone()) {
                    token_index.entry(token).or_default().push(app_id);
                }
            }
        }

        Self {
            names: names.into_iter().collect(),
            by_name,
            owned: owned.into_iter().collect(),
            token_index,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    #[must_use]
    pub fn is_owned(&self, app_id: u32) -> bool {
        self.owned.contains(&app_id)
    }

    #[must_use]
    pub fn contains(&self, app_id: u32) -> bool {
        self.names.contains_key(&app_id)
    }

    #[must_use]
    pub fn name_of(&self, app_id: u32) -> Option<&str> {
        self.names.get(&app_id).map(String::as_str)
    }

    /// Case-insensitive exact match on the canonical name. Among duplicate
    /// names an owned app wins, then the lowest app id.
    #[must_use]
    pub fn lookup_exact(&self, title: &str) -> Option<u32> {
        let ids = self.by_name.get(&normalize_title(title))?;
        ids.iter()
            .copied()
            .find(|id| self.owned.contains(id))
            .or_else(|| ids.iter().copied().min())
    }

    /// App ids sharing at least one word token with `title`.
    ///
    /// Postings are taken rarest token first until [`MAX_CANDIDATES`] is
    /// reached; owned apps from the remaining postings are always included.
    #[must_use]
    pub fn candidates(&self, title: &str) -> Vec<u32> {
        let mut title_tokens = tokens(&strip_platform_suffix(title));
        title_tokens.sort();
        title_tokens.dedup();

        let mut postings: Vec<&Vec<u32>> = title_tokens
            .iter()
            .filter_map(|t| self.token_index.get(t))
            .collect();
        postings.sort_by_key(|p| p.len());

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut capped = false;
        for (i, list) in postings.iter().enumerate() {
            if !capped && i > 0 && seen.len() + list.len() > MAX_CANDIDATES {
                capped = true;
            }
            for &id in *list {
                if (!capped || self.owned.contains(&id)) && seen.insert(id) {
                    out.push(id);
                }
            }
        }
        out
    }
}

// =============================================================================
// On-disk envelopes
// =============================================================================

/// Serialized cache payload with integrity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub version: u32,
    pub cached_at: DateTime<Utc>,
    /// Hex SHA-256 of the JSON encoding of `data`
    pub checksum: String,
    pub data: T,
}

impl<T: Serialize> CacheEnvelope<T> {
    pub fn seal(data: T) -> Result<Self> {
        let checksum = checksum_of(&data)?;
        Ok(Self {
            version: CACHE_VERSION,
            cached_at: Utc::now(),
            checksum,
            data,
        })
    }

    fn verify(&self) -> Result<bool> {
        Ok(checksum_of(&self.data)? == self.checksum)
    }
}

fn checksum_of<T: Serialize>(data: &T) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Result of reading one cache file.
#[derive(Debug)]
enum CacheState<T> {
    Fresh(T),
    Stale(T),
    Missing,
    Corrupt(String),
}

fn read_envelope<T>(path: &Path, ttl: Option<Duration>) -> CacheState<T>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheState::Missing,
        Err(e) => return CacheState::Corrupt(format!("unreadable: {e}")),
    };
    let envelope: CacheEnvelope<T> = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(e) => return CacheState::Corrupt(format!("unparseable: {e}")),
    };
    if envelope.version != CACHE_VERSION {
        let err = CatalogError::VersionMismatch {
            found: envelope.version,
            expected: CACHE_VERSION,
        };
        return CacheState::Corrupt(err.to_string());
    }
    match envelope.verify() {
        Ok(true) => {}
        Ok(false) => {
            let err = CatalogError::ChecksumMismatch {
                path: path.display().to_string(),
            };
            return CacheState::Corrupt(err.to_string());
        }
        Err(e) => return CacheState::Corrupt(e.to_string()),
    }

    let expired = ttl.is_some_and(|ttl| {
        (Utc::now() - envelope.cached_at)
            .to_std()
            .map_or(true, |age| age > ttl)
    });
    if expired {
        CacheState::Stale(envelope.data)
    } else {
        CacheState::Fresh(envelope.data)
    }
}

fn write_envelope<T: Serialize>(path: &Path, data: T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let envelope = CacheEnvelope::seal(data)?;
    let bytes = serde_json::to_vec(&envelope)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write a freshly built payload and confirm it reads back intact.
fn write_verified<T>(path: &Path, data: &T) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    write_envelope(path, data)?;
    match read_envelope::<T>(path, None) {
        CacheState::Fresh(_) => Ok(()),
        _ => Err(CatalogError::ChecksumMismatchAfterRebuild {
            path: path.display().to_string(),
        }
        .into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sanitize_user_id(user_id: &str) -> String {
    let cleaned: String = user_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Disk-backed catalog cache owned by one engine instance.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    dir: PathBuf,
    config: CatalogConfig,
}

impl CatalogCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, config: CatalogConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    #[must_use]
    pub fn owned_path(&self, user_id: &str) -> PathBuf {
        self.dir
            .join(format!("owned_{}.json", sanitize_user_id(user_id)))
    }

    #[must_use]
    pub fn details_path(&self) -> PathBuf {
        self.dir.join(DETAILS_FILE)
    }

    /// Full app listing, from cache when fresh.
    pub async fn get_catalog(&self, source: &dyn CatalogSource) -> Result<Vec<CatalogEntry>> {
        let path = self.catalog_path();
        match read_envelope::<Vec<CatalogEntry>>(&path, Some(self.config.catalog_ttl())) {
            CacheState::Fresh(entries) => {
                debug!(entries = entries.len(), "Using cached catalog");
                Ok(entries)
            }
            CacheState::Stale(entries) => match self.rebuild_catalog(source).await {
                Ok(fresh) => Ok(fresh),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Catalog refresh failed; using expired cache");
                    Ok(entries)
                }
                Err(e) => Err(e),
            },
            CacheState::Missing => self.rebuild_catalog(source).await,
            CacheState::Corrupt(reason) => {
                warn!(path = %path.display(), %reason, "Discarding corrupt catalog cache");
                remove_if_exists(&path)?;
                self.rebuild_catalog(source).await
            }
        }
    }

    /// Owned set for `user_id`, from cache when fresh.
    pub async fn get_owned(&self, source: &dyn CatalogSource, user_id: &str) -> Result<OwnedApps> {
        let path = self.owned_path(user_id);
        match read_envelope::<OwnedApps>(&path, Some(self.config.owned_ttl())) {
            CacheState::Fresh(owned) => {
                debug!(apps = owned.app_ids.len(), "Using cached owned apps");
                Ok(owned)
            }
            CacheState::Corrupt(reason) => {
                warn!(path = %path.display(), %reason, "Discarding corrupt owned-apps cache");
                remove_if_exists(&path)?;
                self.rebuild_owned(source, user_id).await
            }
            CacheState::Stale(_) | CacheState::Missing => self.rebuild_owned(source, user_id).await,
        }
    }

    /// Load (or build) the catalog and owned set and index them.
    pub async fn load_or_build(&self, source: &dyn CatalogSource, user_id: &str) -> Result<Catalog> {
        let entries = self.get_catalog(source).await?;
        let owned = self.get_owned(source, user_id).await?;

        let listed: HashSet<u32> = entries.iter().map(|e| e.app_id).collect();
        let mut details = self.load_details();
        let missing: Vec<u32> = owned
            .app_ids
            .iter()
            .copied()
            .filter(|id| !listed.contains(id) && !details.contains_key(id))
            .collect();

        if !missing.is_empty() {
            let found = self.backfill(source, &missing).await;
            if !found.is_empty() {
                details.extend(found.into_iter().map(|e| (e.app_id, e)));
                let snapshot: Vec<CatalogEntry> = details.values().cloned().collect();
                if let Err(e) = write_envelope(&self.details_path(), snapshot) {
                    warn!(error = %e, "Failed to persist backfilled app details");
                }
            }
        }

        let catalog = Catalog::from_parts(
            entries.into_iter().chain(details.into_values()),
            owned.app_ids,
        );
        info!(
            entries = catalog.len(),
            owned = catalog.owned_count(),
            "Catalog ready"
        );
        Ok(catalog)
    }

    /// Drop every cache file and rebuild from the source.
    pub async fn refresh(&self, source: &dyn CatalogSource, user_id: &str) -> Result<Catalog> {
        self.invalidate(user_id)?;
        self.load_or_build(source, user_id).await
    }

    /// Remove the catalog, details and `user_id`'s owned-set files.
    pub fn invalidate(&self, user_id: &str) -> Result<()> {
        remove_if_exists(&self.catalog_path())?;
        remove_if_exists(&self.details_path())?;
        remove_if_exists(&self.owned_path(user_id))?;
        Ok(())
    }

    /// Seed the catalog file directly.
    pub fn save_catalog(&self, entries: &[CatalogEntry]) -> Result<()> {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|e| e.app_id);
        write_verified(&self.catalog_path(), &entries)
    }

    /// Seed the owned-set file directly.
    pub fn save_owned(&self, user_id: &str, owned: OwnedApps) -> Result<()> {
        write_verified(&self.owned_path(user_id), &owned.normalized())
    }

    async fn rebuild_catalog(&self, source: &dyn CatalogSource) -> Result<Vec<CatalogEntry>> {
        let policy = RetryPolicy::catalog_fetch();
        let mut merged: BTreeMap<u32, String> = BTreeMap::new();
        let mut cursor: Option<u32> = None;
        let mut pages = 0u32;

        loop {
            let page = with_retry(&policy, || source.list_apps(cursor)).await?;
            pages += 1;
            for app in page.apps {
                merged.insert(app.app_id, app.canonical_name);
            }
            match page.next_cursor {
                Some(next) if Some(next) == cursor => {
                    warn!(cursor = next, "Catalog cursor did not advance; stopping pagination");
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let entries: Vec<CatalogEntry> = merged
            .into_iter()
            .map(|(app_id, name)| CatalogEntry::new(app_id, name))
            .collect();
        write_verified(&self.catalog_path(), &entries)?;
        info!(pages, entries = entries.len(), "Catalog rebuilt");
        Ok(entries)
    }

    async fn rebuild_owned(&self, source: &dyn CatalogSource, user_id: &str) -> Result<OwnedApps> {
        let owned = source.owned_apps(user_id).await?.normalized();
        write_verified(&self.owned_path(user_id), &owned)?;
        info!(
            apps = owned.app_ids.len(),
            packages = owned.package_ids.len(),
            "Owned apps refreshed"
        );
        Ok(owned)
    }

    fn load_details(&self) -> BTreeMap<u32, CatalogEntry> {
        let path = self.details_path();
        match read_envelope::<Vec<CatalogEntry>>(&path, None) {
            CacheState::Fresh(entries) | CacheState::Stale(entries) => {
                entries.into_iter().map(|e| (e.app_id, e)).collect()
            }
            CacheState::Missing => BTreeMap::new(),
            CacheState::Corrupt(reason) => {
                warn!(path = %path.display(), %reason, "Discarding corrupt app-details cache");
                let _ = remove_if_exists(&path);
                BTreeMap::new()
            }
        }
    }

    /// Concurrent detail lookups for `app_ids`; failures are logged and skipped.
    async fn backfill(&self, source: &dyn CatalogSource, app_ids: &[u32]) -> Vec<CatalogEntry> {
        let policy = RetryPolicy::app_detail();
        let concurrency = self.config.backfill_concurrency.max(1);
        info!(
            missing = app_ids.len(),
            concurrency, "Backfilling owned apps absent from the listing"
        );

        let results: Vec<(u32, Result<Option<CatalogEntry>>)> = stream::iter(app_ids.iter().copied())
            .map(|app_id| {
                let policy = &policy;
                async move { (app_id, with_retry(policy, || source.app_detail(app_id)).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut found = Vec::new();
        let mut unresolved = Vec::new();
        for (app_id, result) in results {
            match result {
                Ok(Some(entry)) => found.push(entry),
                Ok(None) => unresolved.push(app_id),
                Err(e) => {
                    debug!(app_id, error = %e, "App detail lookup failed");
                    unresolved.push(app_id);
                }
            }
        }
        if !unresolved.is_empty() {
            unresolved.sort_unstable();
            let sample: Vec<String> = unresolved.iter().take(10).map(u32::to_string).collect();
            warn!(
                count = unresolved.len(),
                sample = %sample.join(", "),
                "Unable to resolve names for some owned apps"
            );
        }
        found
    }
}
