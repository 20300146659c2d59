//! Friend/co-op key detection.
//!
//! Bonus keys meant for gifting ("Friend Pass", "Extra Copy", ...) must never
//! be redeemed on the user's own account. Patterns are grouped in confidence
//! tiers and checked tier by tier over the title, the machine name and the
//! key-type label; the first hit wins.
//!
//! User patterns come from a text file, one per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! HIGH:tag-along pass
//! LOW:spare
//! party pack          <- no prefix means MEDIUM
//! ```

use aho_corasick::AhoCorasick;
use regex::RegexSet;
use serde::Serialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::model::KeyRecord;

const HIGH: &[&str] = &[
    "friend pass",
    "friends pass",
    "friend's pass",
    "guest pass",
    "guest key",
    "guest access",
    "extra copy",
    "bonus copy",
    "co-op pass",
    "coop pass",
    "co op pass",
];

const SUFFIXES: &[&str] = &[
    " - extra", " (extra)", "[extra]", " - friend", " (friend)", "[friend]", " - guest",
    " (guest)", "[guest]", " - gift", " (gift)", "[gift]",
];

const KNOWN_GAMES: &[&str] = &[
    "minion masters",
    "dont starve together",
    "don't starve together",
    "portal 2",
    "serious sam",
    "dead island",
    "killing floor",
    "castle crashers",
    "battleblock theater",
    "counter-strike",
    "half-life 2",
    "dead by daylight - stranger things",
    "insurgency",
    "arma",
];

const MEDIUM: &[&str] = &[
    "friend key",
    "friends key",
    "friend's key",
    "multiplayer pass",
    "multi-player pass",
    "companion pass",
    "invite key",
    "invitation key",
    "invite pass",
    "additional copy",
    "additional key",
    "2-pack",
    "3-pack",
    "4-pack",
    "2 pack",
    "3 pack",
    "4 pack",
    "gift copy",
    "giftable copy",
    "gift key",
    "buddy pass",
    "buddy key",
    "spare copy",
    "spare key",
];

const NON_GAME: &[&str] = &[
    "soundtrack",
    "ost",
    "original soundtrack",
    "artbook",
    "art book",
    "digital comic",
    "comic book",
    "wallpaper",
    "avatar",
    "badge",
];

const LOW: &[&str] = &["extra", "bonus", "additional"];

const EXACT: &[&str] = &["extra", "bonus"];

/// Confidence tier of a friend pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendTier {
    High,
    Suffix,
    KnownGame,
    Medium,
    NonGame,
    Low,
    Exact,
}

impl FriendTier {
    #[must_use]
    pub fn confidence(self) -> f64 {
        match self {
            Self::High | Self::Suffix => 1.0,
            Self::KnownGame => 0.85,
            Self::Medium => 0.75,
            Self::NonGame => 0.7,
            Self::Exact => 0.6,
            Self::Low => 0.5,
        }
    }
}

/// Which key field matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendField {
    Name,
    MachineName,
    KeyType,
}

impl FriendField {
    fn label(self) -> &'static str {
        match self {
            Self::Name => "human_name",
            Self::MachineName => "machine_name",
            Self::KeyType => "key_type",
        }
    }
}

/// A positive classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendMatch {
    pub tier: FriendTier,
    pub pattern: String,
    pub field: FriendField,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Substring,
    Suffix,
    WholeWord,
}

#[derive(Debug, Clone)]
enum Matcher {
    Substring(AhoCorasick),
    WholeWord(RegexSet),
    Suffix,
}

#[derive(Debug, Clone)]
struct TierMatcher {
    tier: FriendTier,
    patterns: Vec<String>,
    fields: &'static [FriendField],
    matcher: Matcher,
}

const ALL_FIELDS: &[FriendField] = &[FriendField::Name, FriendField::MachineName, FriendField::KeyType];
const NAME_FIELDS: &[FriendField] = &[FriendField::Name, FriendField::MachineName];

impl TierMatcher {
    fn build(
        tier: FriendTier,
        patterns: Vec<String>,
        fields: &'static [FriendField],
        rule: Rule,
    ) -> Result<Self, ConfigError> {
        let matcher = match rule {
            Rule::Substring => Matcher::Substring(
                AhoCorasick::new(&patterns)
                    .map_err(|e| ConfigError::ValidationError(format!("friend patterns: {e}")))?,
            ),
            Rule::WholeWord => Matcher::WholeWord(
                RegexSet::new(
                    patterns
                        .iter()
                        .map(|p| format!(r"\b{}\b", regex::escape(p))),
                )
                .map_err(|e| ConfigError::ValidationError(format!("friend patterns: {e}")))?,
            ),
            Rule::Suffix => Matcher::Suffix,
        };
        Ok(Self {
            tier,
            patterns,
            fields,
            matcher,
        })
    }

    /// Lowest pattern index matching `text`.
    fn first_match(&self, text: &str) -> Option<usize> {
        if text.is_empty() {
            return None;
        }
        match &self.matcher {
            Matcher::Substring(ac) => ac
                .find_overlapping_iter(text)
                .map(|m| m.pattern().as_usize())
                .min(),
            Matcher::WholeWord(set) => set.matches(text).iter().next(),
            Matcher::Suffix => self.patterns.iter().position(|p| text.ends_with(p.as_str())),
        }
    }

    /// Earliest pattern matching any field; among fields, the first in order.
    fn check(&self, fields: &[(FriendField, String)]) -> Option<(usize, FriendField)> {
        let mut best: Option<(usize, FriendField)> = None;
        for (field, text) in fields {
            if !self.fields.contains(field) {
                continue;
            }
            if let Some(idx) = self.first_match(text) {
                if best.is_none_or(|(b, _)| idx < b) {
                    best = Some((idx, *field));
                }
            }
        }
        best
    }
}

/// Classifies keys against built-in and user-supplied friend patterns.
#[derive(Debug, Clone)]
pub struct FriendClassifier {
    tiers: Vec<TierMatcher>,
    auto_threshold: f64,
}

impl FriendClassifier {
    /// Built-in patterns only.
    pub fn new(auto_threshold: f64) -> Result<Self, ConfigError> {
        Self::with_user_patterns("", auto_threshold)
    }

    /// Built-in patterns plus the contents of a pattern file.
    pub fn with_user_patterns(text: &str, auto_threshold: f64) -> Result<Self, ConfigError> {
        let owned = |list: &[&str]| list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
        let mut high = owned(HIGH);
        let mut medium = owned(MEDIUM);
        let mut low = owned(LOW);
        let mut exact = owned(EXACT);

        for (tier, pattern) in parse_user_patterns(text) {
            match tier {
                FriendTier::High => high.push(pattern),
                FriendTier::Low => low.push(pattern),
                FriendTier::Exact => exact.push(pattern),
                _ => medium.push(pattern),
            }
        }

        let tiers = vec![
            TierMatcher::build(FriendTier::High, high, ALL_FIELDS, Rule::Substring)?,
            TierMatcher::build(FriendTier::Suffix, owned(SUFFIXES), NAME_FIELDS, Rule::Suffix)?,
            TierMatcher::build(FriendTier::KnownGame, owned(KNOWN_GAMES), NAME_FIELDS, Rule::WholeWord)?,
            TierMatcher::build(FriendTier::Medium, medium, ALL_FIELDS, Rule::Substring)?,
            TierMatcher::build(FriendTier::NonGame, owned(NON_GAME), NAME_FIELDS, Rule::WholeWord)?,
            TierMatcher::build(FriendTier::Low, low, ALL_FIELDS, Rule::WholeWord)?,
            TierMatcher::build(FriendTier::Exact, exact, ALL_FIELDS, Rule::WholeWord)?,
        ];
        Ok(Self {
            tiers,
            auto_threshold,
        })
    }

    /// Built-in patterns plus `path` when it exists. A missing file is fine.
    pub fn load(path: &Path, auto_threshold: f64) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "Loaded friend key patterns");
                text
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(ConfigError::ReadFailed(
                    path.display().to_string(),
                    e.to_string(),
                ));
            }
        };
        Self::with_user_patterns(&text, auto_threshold)
    }

    #[must_use]
    pub fn auto_threshold(&self) -> f64 {
        self.auto_threshold
    }

    /// First matching pattern, if any, regardless of confidence.
    #[must_use]
    pub fn classify(&self, key: &KeyRecord) -> Option<FriendMatch> {
        let fields = [
            (FriendField::Name, key.name.to_lowercase()),
            (FriendField::MachineName, key.machine_name.to_lowercase()),
            (FriendField::KeyType, key.key_type_human_name.to_lowercase()),
        ];

        self.tiers.iter().find_map(|tier| {
            let (idx, field) = tier.check(&fields)?;
            let pattern = tier.patterns[idx].clone();
            let reason = match tier.tier {
                FriendTier::Suffix => format!("{} ends with '{pattern}'", field.label()),
                FriendTier::KnownGame => format!("known friend game: '{pattern}'"),
                FriendTier::NonGame => format!("non-game content: '{pattern}'"),
                FriendTier::Low => format!("{} contains '{pattern}' (low confidence)", field.label()),
                FriendTier::Exact => format!("{} exactly matches '{pattern}'", field.label()),
                FriendTier::High | FriendTier::Medium => {
                    format!("{} contains '{pattern}'", field.label())
                }
            };
            Some(FriendMatch {
                tier: tier.tier,
                pattern,
                field,
                confidence: tier.tier.confidence(),
                reason,
            })
        })
    }

    /// `IsFriendKey`: a match at or above the auto-exclusion threshold.
    #[must_use]
    pub fn is_friend_key(&self, key: &KeyRecord) -> bool {
        self.classify(key)
            .is_some_and(|m| m.confidence >= self.auto_threshold)
    }
}

/// Parse a user pattern file into `(tier, lowercase pattern)` pairs.
#[must_use]
pub fn parse_user_patterns(text: &str) -> Vec<(FriendTier, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (tier, pattern) = match line.split_once(':') {
                Some((prefix, rest)) => match prefix.trim().to_ascii_uppercase().as_str() {
                    "HIGH" => (FriendTier::High, rest),
                    "MEDIUM" => (FriendTier::Medium, rest),
                    "LOW" => (FriendTier::Low, rest),
                    "EXACT" => (FriendTier::Exact, rest),
                    _ => (FriendTier::Medium, rest),
                },
                None => (FriendTier::Medium, line),
            };
            let pattern = pattern.trim().to_lowercase();
            (!pattern.is_empty()).then_some((tier, pattern))
        })
        .collect()
}
