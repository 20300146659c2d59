//! Title similarity scoring.
//!
//! The resolver only depends on the [`Similarity`] trait, so the matching
//! strategy can be swapped without touching its control flow. The default
//! [`TokenSimilarity`] compares word tokens order-insensitively, which copes
//! with bundle titles that reorder or extend store titles
//! ("Game: Deluxe Edition" vs "Game Deluxe Edition").
//!
//! Scores are on a 0..=100 scale.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Pluggable `similarity(a, b) -> score` function.
pub trait Similarity: Send + Sync {
    /// Final score used for the accept threshold.
    fn score(&self, a: &str, b: &str) -> f64;

    /// Cheap, permissive score used to pick candidates before [`Self::score`].
    fn prefilter(&self, a: &str, b: &str) -> f64 {
        self.score(a, b)
    }
}

/// Token sort / token set ratios over normalized Levenshtein similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSimilarity;

impl Similarity for TokenSimilarity {
    fn score(&self, a: &str, b: &str) -> f64 {
        token_sort_ratio(a, b)
    }

    fn prefilter(&self, a: &str, b: &str) -> f64 {
        token_set_ratio(a, b)
    }
}

static PLATFORM_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\(steam\)\s*$").unwrap());
static VERSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([ivx]+|\d+)\b").unwrap());

/// Strip a trailing "(Steam)" platform suffix and collapse whitespace.
///
/// Only the parenthesised suffix is removed: "SteamWorld Dig" is untouched.
#[must_use]
pub fn strip_platform_suffix(name: &str) -> String {
    let stripped = PLATFORM_SUFFIX.replace(name, "");
    collapse_whitespace(&stripped)
}

/// Normalized exact-match key: suffix stripped, lowercase, single spaces.
#[must_use]
pub fn normalize_title(name: &str) -> String {
    strip_platform_suffix(name).to_lowercase()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase alphanumeric word tokens.
#[must_use]
pub fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    (strsim::normalized_levenshtein(a, b) * 100.0).round()
}

/// Compare the sorted token sequences of both strings.
#[must_use]
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let mut ta = tokens(a);
    let mut tb = tokens(b);
    ta.sort();
    tb.sort();
    ratio(&ta.join(" "), &tb.join(" "))
}

/// Compare shared tokens against each side's remainder; a title whose tokens
/// are a subset of the other's scores 100.
#[must_use]
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let sa: BTreeSet<String> = tokens(a).into_iter().collect();
    let sb: BTreeSet<String> = tokens(b).into_iter().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }

    let common = sa.intersection(&sb).cloned().collect::<Vec<_>>().join(" ");
    let only_a = sa.difference(&sb).cloned().collect::<Vec<_>>().join(" ");
    let only_b = sb.difference(&sa).cloned().collect::<Vec<_>>().join(" ");

    let combined_a = format!("{common} {only_a}").trim().to_string();
    let combined_b = format!("{common} {only_b}").trim().to_string();

    let mut best = ratio(&combined_a, &combined_b);
    if !common.is_empty() {
        best = best
            .max(ratio(&common, &combined_a))
            .max(ratio(&common, &combined_b));
    }
    best
}

/// Split a title into its version-free base and its version tokens.
///
/// Versions are Roman numerals or Arabic numbers; years (1900..=2100) and a
/// lone "1" or "0" are treated as part of the title.
#[must_use]
pub fn extract_versions(name: &str) -> (String, Vec<String>) {
    let mut versions = Vec::new();
    let mut base = String::with_capacity(name.len());
    let mut last = 0;

    for caps in VERSION_TOKEN.captures_iter(name) {
        let Some(m) = caps.get(1) else { continue };
        let token = m.as_str();
        let keep_as_version = if token.chars().all(|c| c.is_ascii_digit()) {
            let num: u64 = token.parse().unwrap_or(0);
            !(1900..=2100).contains(&num) && (num >= 2 || token.len() >= 2)
        } else {
            true
        };
        if keep_as_version {
            versions.push(token.to_uppercase());
            base.push_str(&name[last..m.start()]);
            last = m.end();
        }
    }
    base.push_str(&name[last..]);

    (collapse_whitespace(&base), versions)
}
