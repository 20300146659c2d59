//! Key, catalog and outcome types shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Value the key source reports in place of a key that can no longer be revealed.
pub const EXPIRED_MARKER: &str = "EXPIRED";

/// Length of a platform product key (`AAAAA-BBBBB-CCCCC`).
pub const KEY_LENGTH: usize = 17;

/// One redeemable entry supplied by the key source.
///
/// Identity is `(gamekey, name)`: monthly bundles issue several titles under a
/// single `gamekey`, so `gamekey` alone never identifies a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque batch identifier, shared by every title of an order
    pub gamekey: String,
    /// Display title
    #[serde(alias = "human_name")]
    pub name: String,
    /// Internal machine-readable name
    #[serde(default)]
    pub machine_name: String,
    /// Platform target, e.g. "steam"
    #[serde(default = "default_key_type")]
    pub key_type: String,
    /// Human-readable key type label
    #[serde(default)]
    pub key_type_human_name: String,
    /// Redeemable string; `None` or empty until revealed
    #[serde(default, alias = "redeemed_key_val")]
    pub revealed_key: Option<String>,
    #[serde(default)]
    pub order_id: String,
    /// Monthly-choice grouping, when the key belongs to one
    #[serde(default)]
    pub bundle_month: Option<String>,
    /// A choice slot that has not been selected yet (no key exists)
    #[serde(default)]
    pub is_choice_unclaimed: bool,
    /// Platform app id supplied by the key source
    #[serde(default, alias = "steam_app_id")]
    pub app_id_hint: Option<u32>,
    /// Key source already reports the key as expired
    #[serde(default, alias = "is_expired")]
    pub expired: bool,
    #[serde(default)]
    pub is_gift: bool,
}

fn default_key_type() -> String {
    "steam".to_string()
}

impl KeyRecord {
    #[must_use]
    pub fn new(gamekey: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gamekey: gamekey.into(),
            name: name.into(),
            machine_name: String::new(),
            key_type: default_key_type(),
            key_type_human_name: String::new(),
            revealed_key: None,
            order_id: String::new(),
            bundle_month: None,
            is_choice_unclaimed: false,
            app_id_hint: None,
            expired: false,
            is_gift: false,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.revealed_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle_month = Some(bundle.into());
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: u32) -> Self {
        self.app_id_hint = Some(app_id);
        self
    }

    #[must_use]
    pub fn with_machine_name(mut self, machine_name: impl Into<String>) -> Self {
        self.machine_name = machine_name.into();
        self
    }

    #[must_use]
    pub fn id(&self) -> KeyId {
        KeyId::new(&self.gamekey, &self.name)
    }

    /// The revealed key string, if any non-blank value is present.
    #[must_use]
    pub fn revealed(&self) -> Option<&str> {
        self.revealed_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    #[must_use]
    pub fn is_revealed(&self) -> bool {
        self.revealed().is_some()
    }

    /// True when the key targets the redemption platform.
    #[must_use]
    pub fn targets_platform(&self) -> bool {
        self.key_type.eq_ignore_ascii_case("steam")
    }
}

/// Identity of a key: `(gamekey, lowercase trimmed name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId {
    pub gamekey: String,
    pub name: String,
}

impl KeyId {
    #[must_use]
    pub fn new(gamekey: &str, name: &str) -> Self {
        Self {
            gamekey: gamekey.trim().to_string(),
            name: name.trim().to_lowercase(),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gamekey, self.name)
    }
}

/// One platform catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub app_id: u32,
    pub canonical_name: String,
}

impl CatalogEntry {
    #[must_use]
    pub fn new(app_id: u32, canonical_name: impl Into<String>) -> Self {
        Self {
            app_id,
            canonical_name: canonical_name.into(),
        }
    }
}

/// Grouping of keys issued together by the key source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Choice slots still waiting for a selection
    #[serde(default)]
    pub unclaimed_choices: u32,
}

/// Whether the title behind a key is already owned on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnershipDecision {
    Owned,
    Unowned,
    /// No confident match: never redeemed, always reported
    Unknown,
}

impl fmt::Display for OwnershipDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned => write!(f, "OWNED"),
            Self::Unowned => write!(f, "UNOWNED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Persisted outcome of a key. `Errored` is the only revisitable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionOutcome {
    Redeemed,
    AlreadyOwned,
    Errored,
    Expired,
    Friend,
}

impl RedemptionOutcome {
    pub const ALL: [Self; 5] = [
        Self::Redeemed,
        Self::AlreadyOwned,
        Self::Errored,
        Self::Expired,
        Self::Friend,
    ];

    pub const TERMINAL: [Self; 4] = [
        Self::Redeemed,
        Self::AlreadyOwned,
        Self::Expired,
        Self::Friend,
    ];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Errored)
    }

    /// Ledger file name for this outcome category.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Redeemed => "redeemed.csv",
            Self::AlreadyOwned => "already_owned.csv",
            Self::Errored => "errored.csv",
            Self::Expired => "expired.csv",
            Self::Friend => "friend_keys.csv",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redeemed => "REDEEMED",
            Self::AlreadyOwned => "ALREADY_OWNED",
            Self::Errored => "ERRORED",
            Self::Expired => "EXPIRED",
            Self::Friend => "FRIEND",
        }
    }
}

impl fmt::Display for RedemptionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REDEEMED" => Ok(Self::Redeemed),
            "ALREADY_OWNED" => Ok(Self::AlreadyOwned),
            "ERRORED" => Ok(Self::Errored),
            "EXPIRED" => Ok(Self::Expired),
            "FRIEND" => Ok(Self::Friend),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Check the platform key shape: three dash-separated groups of five.
#[must_use]
pub fn valid_key_format(key: &str) -> bool {
    if key.len() != KEY_LENGTH {
        return false;
    }
    let parts: Vec<&str> = key.split('-').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| part.len() == 5 && part.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// How strictly a key string is checked before it is sent to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// Any non-blank single token that is not the expiry marker or a link
    #[default]
    Lenient,
    /// Exact platform shape, see [`valid_key_format`]
    Platform,
}

impl KeyFormat {
    #[must_use]
    pub fn accepts(self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() || is_expired_marker(key) {
            return false;
        }
        match self {
            Self::Lenient => {
                !key.contains(char::is_whitespace)
                    && !key.starts_with("http://")
                    && !key.starts_with("https://")
            }
            Self::Platform => valid_key_format(key),
        }
    }
}

#[must_use]
pub fn is_expired_marker(key: &str) -> bool {
    key.trim().eq_ignore_ascii_case(EXPIRED_MARKER)
}

/// Mask all but the first group of a key for logs.
#[must_use]
pub fn redact_key(key: &str) -> String {
    match key.split_once('-') {
        Some((head, tail)) => {
            let masked: String = tail
                .chars()
                .map(|c| if c == '-' { '-' } else { '*' })
                .collect();
            format!("{head}-{masked}")
        }
        None if key.is_empty() => String::new(),
        None => "*".repeat(key.chars().count()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_ignores_case_and_whitespace_of_name() {
        let a = KeyId::new("bundle42", "Game A");
        let b = KeyId::new(" bundle42 ", "  game a ");
        assert_eq!(a, b);
        assert_ne!(a, KeyId::new("bundle42", "Game B"));
        assert_ne!(a, KeyId::new("BUNDLE42", "Game A"));
    }

    #[test]
    fn shared_gamekey_yields_distinct_ids() {
        let a = KeyRecord::new("month-01", "First Title");
        let b = KeyRecord::new("month-01", "Second Title");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn key_format_validation() {
        assert!(valid_key_format("ABCDE-12345-FGHIJ"));
        assert!(!valid_key_format("ABCD-1234"));
        assert!(!valid_key_format("ABCDE-12345-FGHI"));
        assert!(!valid_key_format("ABCDE12345-FGHIJK"));
        assert!(!valid_key_format(EXPIRED_MARKER));
        assert!(!valid_key_format(""));
        assert!(!valid_key_format("https://gift.li"));
    }

    #[test]
    fn lenient_format_rejects_only_unusable_values() {
        assert!(KeyFormat::Lenient.accepts("ABCD-1234"));
        assert!(KeyFormat::Lenient.accepts("ABCDE-12345-FGHIJ"));
        assert!(!KeyFormat::Lenient.accepts(""));
        assert!(!KeyFormat::Lenient.accepts("expired"));
        assert!(!KeyFormat::Lenient.accepts("https://www.example.com/gift?key=abc"));
        assert!(!KeyFormat::Lenient.accepts("two words"));
        assert!(!KeyFormat::Platform.accepts("ABCD-1234"));
        assert!(KeyFormat::Platform.accepts("ABCDE-12345-FGHIJ"));
    }

    #[test]
    fn revealed_treats_blank_as_unrevealed() {
        let key = KeyRecord::new("g", "n").with_key("   ");
        assert!(!key.is_revealed());
        let key = KeyRecord::new("g", "n").with_key(" ABCDE-12345-FGHIJ ");
        assert_eq!(key.revealed(), Some("ABCDE-12345-FGHIJ"));
    }

    #[test]
    fn redact_keeps_first_group_only() {
        assert_eq!(redact_key("ABCDE-12345-FGHIJ"), "ABCDE-*****-*****");
        assert_eq!(redact_key("secret"), "******");
        assert_eq!(redact_key(""), "");
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for outcome in RedemptionOutcome::ALL {
            let parsed: RedemptionOutcome = outcome.as_str().parse().unwrap();
            assert_eq!(parsed, outcome);
        }
        assert!("bogus".parse::<RedemptionOutcome>().is_err());
        assert!(!RedemptionOutcome::Errored.is_terminal());
        assert!(RedemptionOutcome::Friend.is_terminal());
    }

    #[test]
    fn key_record_accepts_source_field_names() {
        let json = r#"{
            "gamekey": "abc",
            "human_name": "Game A",
            "redeemed_key_val": "ABCDE-12345-FGHIJ",
            "steam_app_id": 620
        }"#;
        let key: KeyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(key.name, "Game A");
        assert_eq!(key.app_id_hint, Some(620));
        assert_eq!(key.key_type, "steam");
        assert!(key.is_revealed());
    }
}
