//! Ownership resolution: is the title behind a key already owned?
//!
//! Order of evidence:
//! 1. an app id hint from the key source that is in the owned set;
//! 2. an exact (case-insensitive, platform-suffix-stripped) catalog name;
//! 3. the best fuzzy candidate at or above `fuzzy_threshold`, after the
//!    version guard.
//!
//! A matched app in the owned set is `OWNED`, a matched app outside it is
//! `UNOWNED`. With no match the hint decides (`UNOWNED`) if present;
//! otherwise the decision is `UNKNOWN` and the key is never redeemed.

use serde::Serialize;
use std::cmp::Ordering;

use crate::catalog::Catalog;
use crate::config::MatchingConfig;
use crate::model::{KeyRecord, OwnershipDecision};
use crate::similarity::{Similarity, TokenSimilarity, extract_versions, strip_platform_suffix};

/// Which evidence produced a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    AppIdHint,
    Exact,
    Fuzzy,
    None,
}

/// Decision plus the match that backs it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub decision: OwnershipDecision,
    pub app_id: Option<u32>,
    pub matched_name: Option<String>,
    /// Similarity score, 100 for hint and exact matches
    pub score: f64,
    pub method: MatchMethod,
}

impl Resolution {
    fn unknown() -> Self {
        Self {
            decision: OwnershipDecision::Unknown,
            app_id: None,
            matched_name: None,
            score: 0.0,
            method: MatchMethod::None,
        }
    }

    fn matched(catalog: &Catalog, app_id: u32, score: f64, method: MatchMethod) -> Self {
        let decision = if catalog.is_owned(app_id) {
            OwnershipDecision::Owned
        } else {
            OwnershipDecision::Unowned
        };
        Self {
            decision,
            app_id: Some(app_id),
            matched_name: catalog.name_of(app_id).map(str::to_string),
            score,
            method,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    app_id: u32,
    score: f64,
    owned: bool,
}

impl Candidate {
    /// Higher score first, then owned apps, then lower app id.
    fn better_than(&self, other: &Self) -> bool {
        match self.score.partial_cmp(&other.score) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) | None => false,
            Some(Ordering::Equal) => {
                (self.owned && !other.owned)
                    || (self.owned == other.owned && self.app_id < other.app_id)
            }
        }
    }
}

/// Resolves keys against a [`Catalog`] with a pluggable [`Similarity`].
#[derive(Debug, Clone)]
pub struct OwnershipResolver<S = TokenSimilarity> {
    similarity: S,
    config: MatchingConfig,
}

impl OwnershipResolver<TokenSimilarity> {
    #[must_use]
    pub fn new(config: MatchingConfig) -> Self {
        Self::with_similarity(TokenSimilarity, config)
    }
}

impl<S: Similarity> OwnershipResolver<S> {
    #[must_use]
    pub fn with_similarity(similarity: S, config: MatchingConfig) -> Self {
        Self { similarity, config }
    }

    #[must_use]
    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// `Resolve(KeyRecord, Catalog) -> OwnershipDecision`, with match details.
    #[must_use]
    pub fn resolve(&self, key: &KeyRecord, catalog: &Catalog) -> Resolution {
        if let Some(hint) = key.app_id_hint {
            if catalog.is_owned(hint) {
                return Resolution::matched(catalog, hint, 100.0, MatchMethod::AppIdHint);
            }
        }

        let title = strip_platform_suffix(&key.name);
        if title.is_empty() {
            return self.hint_fallback(key, catalog);
        }

        if self.config.exact_first {
            if let Some(app_id) = catalog.lookup_exact(&title) {
                return Resolution::matched(catalog, app_id, 100.0, MatchMethod::Exact);
            }
        }

        if let Some(best) = self.best_fuzzy(&title, catalog) {
            return Resolution::matched(catalog, best.app_id, best.score, MatchMethod::Fuzzy);
        }

        self.hint_fallback(key, catalog)
    }

    fn hint_fallback(&self, key: &KeyRecord, catalog: &Catalog) -> Resolution {
        match key.app_id_hint {
            Some(hint) => Resolution {
                decision: OwnershipDecision::Unowned,
                app_id: Some(hint),
                matched_name: catalog.name_of(hint).map(str::to_string),
                score: 0.0,
                method: MatchMethod::AppIdHint,
            },
            None => Resolution::unknown(),
        }
    }

    fn best_fuzzy(&self, title: &str, catalog: &Catalog) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for app_id in catalog.candidates(title) {
            let Some(name) = catalog.name_of(app_id) else {
                continue;
            };
            let name = strip_platform_suffix(name);
            if self.similarity.prefilter(&name, title) <= self.config.candidate_threshold {
                continue;
            }
            let candidate = Candidate {
                app_id,
                score: self.similarity.score(&name, title),
                owned: catalog.is_owned(app_id),
            };
            if best.is_none_or(|b| candidate.better_than(&b)) {
                best = Some(candidate);
            }
        }

        let best = best?;
        let matched_name = catalog.name_of(best.app_id).map(strip_platform_suffix)?;
        if self.version_conflict(title, &matched_name, best.score) {
            tracing::debug!(
                title,
                candidate = %matched_name,
                score = best.score,
                "Rejected fuzzy match with a different version"
            );
            return None;
        }
        (best.score >= self.config.fuzzy_threshold).then_some(best)
    }

    /// Near-identical base names with different version tokens are different
    /// games unless the whole titles match perfectly.
    fn version_conflict(&self, title: &str, candidate: &str, score: f64) -> bool {
        let (title_base, title_versions) = extract_versions(title);
        if title_versions.is_empty() || score >= 100.0 {
            return false;
        }
        let (candidate_base, candidate_versions) = extract_versions(candidate);
        let base_score = self.similarity.score(&title_base, &candidate_base);
        base_score >= self.config.version_guard_threshold && title_versions != candidate_versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CatalogEntry;

    fn catalog() -> Catalog {
        Catalog::from_parts(
            vec![
                CatalogEntry::new(10, "Portal"),
                CatalogEntry::new(20, "Portal 2"),
                CatalogEntry::new(30, "Total War: WARHAMMER II"),
                CatalogEntry::new(31, "Total War: WARHAMMER III"),
                CatalogEntry::new(40, "Game A"),
                CatalogEntry::new(50, "Hollow Knight: Voidheart Edition"),
                CatalogEntry::new(60, "Owned Classic"),
            ],
            vec![10, 30, 60],
        )
    }

    fn resolver() -> OwnershipResolver {
        OwnershipResolver::new(MatchingConfig::default())
    }

    #[test]
    fn example_key_is_unowned() {
        let key = KeyRecord::new("bundle42", "Game A").with_key("ABCD-1234");
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Unowned);
        assert_eq!(res.app_id, Some(40));
        assert_eq!(res.method, MatchMethod::Exact);
    }

    #[test]
    fn exact_match_ignores_case_and_platform_suffix() {
        let key = KeyRecord::new("g", "PORTAL (Steam)");
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Owned);
        assert_eq!(res.app_id, Some(10));
    }

    #[test]
    fn owned_hint_wins_over_names() {
        let key = KeyRecord::new("g", "Completely Different").with_app_id(60);
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Owned);
        assert_eq!(res.method, MatchMethod::AppIdHint);
    }

    #[test]
    fn unowned_hint_without_match_is_unowned() {
        let key = KeyRecord::new("g", "Nothing Like It").with_app_id(12345);
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Unowned);
        assert_eq!(res.app_id, Some(12345));
    }

    #[test]
    fn no_match_is_unknown() {
        let key = KeyRecord::new("g", "Some Obscure Indie");
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Unknown);
        assert_eq!(res.method, MatchMethod::None);
    }

    #[test]
    fn fuzzy_match_handles_punctuation_and_order() {
        let key = KeyRecord::new("g", "Hollow Knight - Voidheart Edition");
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.decision, OwnershipDecision::Unowned);
        assert_eq!(res.app_id, Some(50));
        assert_eq!(res.method, MatchMethod::Fuzzy);
    }

    #[test]
    fn sequel_does_not_match_owned_predecessor() {
        let cat = Catalog::from_parts(vec![CatalogEntry::new(30, "Total War: WARHAMMER II")], vec![30]);
        let key = KeyRecord::new("g", "Total War WARHAMMER III");
        let res = resolver().resolve(&key, &cat);
        assert_ne!(res.decision, OwnershipDecision::Owned);
    }

    #[test]
    fn exact_sequel_matches_itself() {
        let key = KeyRecord::new("g", "Total War: WARHAMMER III");
        let res = resolver().resolve(&key, &catalog());
        assert_eq!(res.app_id, Some(31));
        assert_eq!(res.decision, OwnershipDecision::Unowned);
    }

    #[test]
    fn fuzzy_disabled_exact_first_still_finds_exact_by_score() {
        let config = MatchingConfig {
            exact_first: false,
            ..MatchingConfig::default()
        };
        let key = KeyRecord::new("g", "Portal 2");
        let res = OwnershipResolver::new(config).resolve(&key, &catalog());
        assert_eq!(res.app_id, Some(20));
        assert_eq!(res.method, MatchMethod::Fuzzy);
    }

    #[test]
    fn custom_similarity_is_used() {
        struct Never;
        impl Similarity for Never {
            fn score(&self, _a: &str, _b: &str) -> f64 {
                0.0
            }
        }
        let config = MatchingConfig {
            exact_first: false,
            ..MatchingConfig::default()
        };
        let resolver = OwnershipResolver::with_similarity(Never, config);
        let res = resolver.resolve(&KeyRecord::new("g", "Portal"), &catalog());
        assert_eq!(res.decision, OwnershipDecision::Unknown);
    }
}
