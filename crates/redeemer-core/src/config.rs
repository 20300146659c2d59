//! Configuration management for redeemer
//!
//! Handles loading and validation of redeemer.toml configuration files.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::model::KeyFormat;
use crate::retry::RetryPolicy;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "redeemer.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Catalog cache settings
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Ownership matching settings
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Friend/co-op key detection settings
    #[serde(default)]
    pub friend: FriendConfig,

    /// Redemption loop settings
    #[serde(default)]
    pub redemption: RedemptionConfig,

    /// Ledger settings
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding the ledger files and completion record
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding the catalog cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}

/// Catalog cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Lifetime of the full app listing
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,

    /// Lifetime of the owned-app set
    #[serde(default = "default_owned_ttl")]
    pub owned_ttl_secs: u64,

    /// Concurrent detail fetches when backfilling names
    #[serde(default = "default_backfill_concurrency")]
    pub backfill_concurrency: usize,

    /// Entries requested per listing page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_secs: default_catalog_ttl(),
            owned_ttl_secs: default_owned_ttl(),
            backfill_concurrency: default_backfill_concurrency(),
            page_size: default_page_size(),
        }
    }
}

impl CatalogConfig {
    #[must_use]
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }

    #[must_use]
    pub fn owned_ttl(&self) -> Duration {
        Duration::from_secs(self.owned_ttl_secs)
    }
}

fn default_catalog_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_owned_ttl() -> u64 {
    60 * 60
}

fn default_backfill_concurrency() -> usize {
    8
}

fn default_page_size() -> u32 {
    50_000
}

/// Ownership matching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Minimum refined score for a fuzzy match to count
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    /// Minimum prefilter score for a catalog entry to be considered at all
    #[serde(default = "default_candidate_threshold")]
    pub candidate_threshold: f64,

    /// Base-name score above which differing versions reject a match
    #[serde(default = "default_version_guard_threshold")]
    pub version_guard_threshold: f64,

    /// Try exact case-insensitive matching before fuzzy matching
    #[serde(default = "default_true")]
    pub exact_first: bool,

    /// Attempt keys whose ownership could not be determined
    #[serde(default)]
    pub redeem_unknown: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
            candidate_threshold: default_candidate_threshold(),
            version_guard_threshold: default_version_guard_threshold(),
            exact_first: true,
            redeem_unknown: false,
        }
    }
}

fn default_fuzzy_threshold() -> f64 {
    90.0
}

fn default_candidate_threshold() -> f64 {
    70.0
}

fn default_version_guard_threshold() -> f64 {
    85.0
}

fn default_true() -> bool {
    true
}

/// Friend/co-op key detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendConfig {
    /// Exclude friend keys from redemption
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// User pattern file, resolved against the data directory when relative
    #[serde(default = "default_patterns_file")]
    pub patterns_file: PathBuf,

    /// Confidence at or above which a key is recorded as FRIEND
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,

    /// Confidence at or above which a match is reported as uncertain
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

impl Default for FriendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns_file: default_patterns_file(),
            auto_threshold: default_auto_threshold(),
            review_threshold: default_review_threshold(),
        }
    }
}

fn default_patterns_file() -> PathBuf {
    PathBuf::from("friend_key_exclusions.txt")
}

fn default_auto_threshold() -> f64 {
    0.8
}

fn default_review_threshold() -> f64 {
    0.5
}

/// Backoff settings for transient redemption failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientRetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for TransientRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: default_jitter_percent(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl TransientRetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
            Some(self.max_attempts),
        )
    }
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_percent() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    3
}

/// Redemption loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionConfig {
    /// Fixed wait after the platform signals rate limiting
    #[serde(default = "default_rate_limit_pause")]
    pub rate_limit_pause_secs: u64,

    /// Interval between keep-alive pings to the key-source session
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Give up on a key after this many consecutive pauses (unbounded when unset)
    #[serde(default)]
    pub max_rate_limit_pauses: Option<u32>,

    #[serde(default)]
    pub transient_retry: TransientRetryConfig,

    /// Record catalog-owned keys as ALREADY_OWNED instead of leaving them unrecorded
    #[serde(default = "default_true")]
    pub record_owned_as_already_owned: bool,

    /// Treat a repeated title or app id within one run as already owned
    #[serde(default = "default_true")]
    pub skip_in_run_duplicates: bool,

    /// Key shape required before an attempt
    #[serde(default)]
    pub key_format: KeyFormat,
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            rate_limit_pause_secs: default_rate_limit_pause(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            max_rate_limit_pauses: None,
            transient_retry: TransientRetryConfig::default(),
            record_owned_as_already_owned: true,
            skip_in_run_duplicates: true,
            key_format: KeyFormat::default(),
        }
    }
}

impl RedemptionConfig {
    #[must_use]
    pub fn rate_limit_pause(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_secs)
    }

    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

fn default_rate_limit_pause() -> u64 {
    300
}

fn default_keep_alive_interval() -> u64 {
    300
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Store only a masked key in the redeemed and already-owned files
    #[serde(default)]
    pub redact_keys: bool,

    /// How long to wait for another process to release the ledger lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            redact_keys: false,
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from the first file found.
    ///
    /// Search order: `./redeemer.toml`, then `<config dir>/redeemer/redeemer.toml`.
    /// Falls back to defaults when neither exists.
    pub fn load() -> crate::Result<Self> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::load_from(&local);
        }
        if let Some(dir) = dirs::config_dir() {
            let user = dir.join("redeemer").join(CONFIG_FILE_NAME);
            if user.exists() {
                return Self::load_from(&user);
            }
        }
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(shown).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(shown.clone(), e.to_string()))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %shown, "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matching;
        for (name, value) in [
            ("matching.fuzzy_threshold", m.fuzzy_threshold),
            ("matching.candidate_threshold", m.candidate_threshold),
            ("matching.version_guard_threshold", m.version_guard_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if m.candidate_threshold > m.fuzzy_threshold {
            return Err(ConfigError::ValidationError(
                "matching.candidate_threshold must not exceed matching.fuzzy_threshold".into(),
            ));
        }

        let f = &self.friend;
        if !(0.0..=1.0).contains(&f.auto_threshold) || !(0.0..=1.0).contains(&f.review_threshold)
        {
            return Err(ConfigError::ValidationError(
                "friend thresholds must be within 0..=1".into(),
            ));
        }
        if f.review_threshold > f.auto_threshold {
            return Err(ConfigError::ValidationError(
                "friend.review_threshold must not exceed friend.auto_threshold".into(),
            ));
        }

        if !(1..=64).contains(&self.catalog.backfill_concurrency) {
            return Err(ConfigError::ValidationError(format!(
                "catalog.backfill_concurrency must be within 1..=64, got {}",
                self.catalog.backfill_concurrency
            )));
        }
        if self.catalog.page_size == 0 {
            return Err(ConfigError::ValidationError(
                "catalog.page_size must be positive".into(),
            ));
        }

        let r = &self.redemption;
        if r.rate_limit_pause_secs == 0 {
            return Err(ConfigError::ValidationError(
                "redemption.rate_limit_pause_secs must be positive".into(),
            ));
        }
        if r.keep_alive_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "redemption.keep_alive_interval_secs must be positive".into(),
            ));
        }
        if r.transient_retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "redemption.transient_retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "logging.level is not a log level: {}",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// Friend pattern file path, resolved against the data directory.
    #[must_use]
    pub fn friend_patterns_path(&self) -> PathBuf {
        if self.friend.patterns_file.is_absolute() {
            self.friend.patterns_file.clone()
        } else {
            self.general.data_dir.join(&self.friend.patterns_file)
        }
    }

    /// Cache directory, resolved against the data directory when relative.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        if self.general.cache_dir.is_absolute() {
            self.general.cache_dir.clone()
        } else {
            self.general.data_dir.join(&self.general.cache_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.catalog.backfill_concurrency, 8);
        assert_eq!(config.catalog.catalog_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.redemption.rate_limit_pause(), Duration::from_secs(300));
        assert_eq!(config.matching.fuzzy_threshold, 90.0);
        assert!(!config.matching.redeem_unknown);
        assert_eq!(config.redemption.key_format, KeyFormat::Lenient);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.friend.auto_threshold, 0.8);
        assert_eq!(config.redemption.transient_retry.max_attempts, 3);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = Config::from_toml(
            r#"
            [general]
            data_dir = "/tmp/keys"

            [matching]
            fuzzy_threshold = 95.0
            redeem_unknown = true

            [redemption]
            rate_limit_pause_secs = 60
            key_format = "platform"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.data_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(config.matching.fuzzy_threshold, 95.0);
        assert_eq!(config.matching.candidate_threshold, 70.0);
        assert!(config.matching.redeem_unknown);
        assert_eq!(config.redemption.rate_limit_pause_secs, 60);
        assert_eq!(config.redemption.key_format, KeyFormat::Platform);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.cache_path(),
            PathBuf::from("/tmp/keys").join(".cache")
        );
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = Config::from_toml(
            r#"
            [matching]
            fuzzy_threshold = 60.0
            candidate_threshold = 70.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("candidate_threshold"));
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut config = Config::default();
        config.catalog.backfill_concurrency = 0;
        assert!(config.validate().is_err());
        config.catalog.backfill_concurrency = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_error_is_reported() {
        let err = Config::from_toml("[matching\nfuzzy = ").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn load_from_missing_path_is_file_not_found() {
        let err = Config::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn load_from_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[matching]\nfuzzy_threshold = 85.0\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert!((config.matching.fuzzy_threshold - 85.0).abs() < f64::EPSILON);
        assert!(config.matching.exact_first);
    }

    #[test]
    fn friend_patterns_resolve_against_data_dir() {
        let mut config = Config::default();
        config.general.data_dir = PathBuf::from("/data");
        assert_eq!(
            config.friend_patterns_path(),
            PathBuf::from("/data/friend_key_exclusions.txt")
        );
        config.friend.patterns_file = PathBuf::from("/etc/patterns.txt");
        assert_eq!(
            config.friend_patterns_path(),
            PathBuf::from("/etc/patterns.txt")
        );
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
