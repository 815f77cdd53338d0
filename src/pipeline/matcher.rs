//! Maps requested variable names onto the labels the model actually wrote.
//!
//! Exact normalized match first, then a fuzzy fallback scored with the
//! longest-matching-blocks ratio `2·M / (|a| + |b|)`.

use std::collections::{HashMap, HashSet};

use super::normalize::LabelNormalizer;
use super::types::{FieldMap, QueryKey, RawResponseMap};

/// Normalized label → original raw key, built once per response.
///
/// Fuzzy candidates use only the part of a raw key before its first `/`
/// ("Nom / Name" scores as "nom"). Exact lookups also accept the whole key
/// normalized, so a slashed label echoed verbatim still matches. When two
/// raw keys normalize identically the later one wins, keeping the earlier
/// position.
#[derive(Debug, Clone, Default)]
pub struct NormalizedKeyIndex {
    entries: Vec<(String, String)>,
    lookup: HashMap<String, usize>,
    full: HashMap<String, String>,
}

impl NormalizedKeyIndex {
    pub fn build(raw: &RawResponseMap, normalizer: &LabelNormalizer) -> Self {
        let mut index = Self::default();
        for key in raw.keys() {
            let whole = normalizer.normalize(key);
            if !whole.is_empty() {
                index.full.insert(whole, key.to_string());
            }

            let head = key.split('/').next().unwrap_or(key);
            let normalized = normalizer.normalize(head);
            if normalized.is_empty() {
                continue;
            }
            match index.lookup.get(&normalized) {
                Some(&pos) => index.entries[pos].1 = key.to_string(),
                None => {
                    index.lookup.insert(normalized.clone(), index.entries.len());
                    index.entries.push((normalized, key.to_string()));
                }
            }
        }
        index
    }

    /// Exact hit on a whole normalized key, else on a key's head.
    pub fn get(&self, normalized: &str) -> Option<&str> {
        self.full.get(normalized).map(String::as_str).or_else(|| {
            self.lookup
                .get(normalized)
                .map(|&pos| self.entries[pos].1.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r.as_str()))
    }
}

pub struct FieldMatcher {
    normalizer: LabelNormalizer,
    threshold: f64,
}

impl FieldMatcher {
    pub fn new(normalizer: LabelNormalizer, threshold: f64) -> Self {
        Self {
            normalizer,
            threshold,
        }
    }

    pub fn index(&self, raw: &RawResponseMap) -> NormalizedKeyIndex {
        NormalizedKeyIndex::build(raw, &self.normalizer)
    }

    /// Original raw key best matching `requested`, if any.
    ///
    /// An exact normalized hit always wins. Otherwise the highest fuzzy score
    /// at or above the threshold is taken; equal scores go to the key that
    /// appeared first in the response.
    pub fn match_field<'a>(&self, requested: &str, index: &'a NormalizedKeyIndex) -> Option<&'a str> {
        let wanted = self.normalizer.normalize(requested);
        if wanted.is_empty() {
            return None;
        }
        index
            .get(&wanted)
            .or_else(|| self.fuzzy_match(&wanted, index, &HashSet::new()))
    }

    /// Best fuzzy candidate for an already normalized label. When that
    /// candidate is in `taken` there is no match; the runner-up is never used.
    fn fuzzy_match<'a>(
        &self,
        wanted: &str,
        index: &'a NormalizedKeyIndex,
        taken: &HashSet<&str>,
    ) -> Option<&'a str> {
        let mut best: Option<(f64, &str, &str)> = None;
        for (normalized, raw) in index.iter() {
            let score = similarity_ratio(wanted, normalized);
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, normalized, raw));
            }
        }

        match best {
            Some((_, normalized, raw)) if taken.contains(raw) => {
                tracing::debug!(
                    requested = wanted,
                    matched = normalized,
                    "Best fuzzy candidate already claimed"
                );
                None
            }
            Some((score, normalized, raw)) if score >= self.threshold => {
                tracing::debug!(
                    requested = wanted,
                    matched = normalized,
                    score,
                    "Fuzzy label match"
                );
                Some(raw)
            }
            _ => None,
        }
    }

    /// Resolve every query key against the raw response.
    ///
    /// Exact matches are assigned first for all queries. A fuzzy match then
    /// only counts when the best-scoring raw key is still unclaimed, so
    /// "Sexe: Femme" cannot borrow the answer given for "Sexe: Homme". Unmatched
    /// keys are left out; the consolidator reports them as not provided.
    pub fn match_all(&self, queries: &[QueryKey], raw: &RawResponseMap) -> FieldMap {
        let index = self.index(raw);
        let wanted: Vec<String> = queries
            .iter()
            .map(|q| self.normalizer.normalize(&q.key))
            .collect();

        let mut taken: HashSet<&str> = HashSet::new();
        let mut resolved: Vec<Option<&str>> = wanted
            .iter()
            .map(|w| if w.is_empty() { None } else { index.get(w) })
            .collect();
        taken.extend(resolved.iter().flatten().copied());

        for (w, slot) in wanted.iter().zip(resolved.iter_mut()) {
            if slot.is_some() || w.is_empty() {
                continue;
            }
            *slot = self.fuzzy_match(w, &index, &taken);
            if let Some(raw_key) = *slot {
                taken.insert(raw_key);
            }
        }

        let mut matched = FieldMap::new();
        for (query, slot) in queries.iter().zip(resolved) {
            if let Some(value) = slot.and_then(|raw_key| raw.get(raw_key)) {
                matched.insert(query.key.clone(), value);
            }
        }
        matched
    }
}

// ──────────────────────────────────────────────
// Similarity
// ──────────────────────────────────────────────

/// Ratio of matched characters over total length, in `0.0..=1.0`.
///
/// Matching blocks are found recursively: the longest common substring
/// (earliest in `a`, then earliest in `b`, on ties), then the same on the
/// pieces to its left and right. Two empty strings score 1.0.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common run of `a[alo..ahi]` and `b[blo..bhi]` as `(i, j, len)`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
    // run[j] = length of the common run ending at a[i-1], b[j-1]
    let mut prev = vec![0usize; bhi - blo + 1];
    let mut curr = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        for j in blo..bhi {
            let slot = j - blo + 1;
            curr[slot] = if a[i] == b[j] { prev[slot - 1] + 1 } else { 0 };
            let k = curr[slot];
            if k > best_k {
                best_i = i + 1 - k;
                best_j = j + 1 - k;
                best_k = k;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    (best_i, best_j, best_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn matcher() -> FieldMatcher {
        let config = PipelineConfig::default();
        FieldMatcher::new(
            LabelNormalizer::new(&config.label_corrections),
            config.fuzzy_match_threshold,
        )
    }

    fn raw(pairs: &[(&str, &str)]) -> RawResponseMap {
        pairs.iter().copied().collect()
    }

    // ── similarity_ratio ──

    #[test]
    fn ratio_identical_is_one() {
        assert!((similarity_ratio("abcd", "abcd") - 1.0).abs() < f64::EPSILON);
        assert!((similarity_ratio("", "") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ratio_disjoint_is_zero() {
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        assert_eq!(similarity_ratio("abc", ""), 0.0);
    }

    #[test]
    fn ratio_matches_known_values() {
        // "abcd" vs "bcde": block "bcd" → 2*3/8
        assert!((similarity_ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
        // "nom" vs "nom complet": 2*3/14
        assert!((similarity_ratio("nom", "nom complet") - 6.0 / 14.0).abs() < 1e-9);
        // Two blocks: "ab" then "d" → 2*3/8
        assert!((similarity_ratio("abxd", "abyd") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn ratio_is_symmetric_for_simple_inputs() {
        let pairs = [("prenom", "prenoms"), ("date naissance", "date de naissance")];
        for (a, b) in pairs {
            assert!((similarity_ratio(a, b) - similarity_ratio(b, a)).abs() < 1e-9);
        }
    }

    // ── NormalizedKeyIndex ──

    #[test]
    fn index_uses_text_before_slash() {
        let m = matcher();
        let index = m.index(&raw(&[("Nom / Name", "Dupont")]));
        assert_eq!(index.get("nom"), Some("Nom / Name"));
        assert_eq!(index.get("nom name"), Some("Nom / Name"));
        assert_eq!(index.get("name"), None);
    }

    #[test]
    fn slashed_request_matches_its_verbatim_echo() {
        let m = matcher();
        let index = m.index(&raw(&[("Nom/Prénom", "Dupont Jean"), ("Poids/Taille", "70/175")]));
        assert_eq!(m.match_field("Nom/Prénom", &index), Some("Nom/Prénom"));
        assert_eq!(m.match_field("Poids / Taille", &index), Some("Poids/Taille"));
        assert_eq!(m.match_field("Poids", &index), Some("Poids/Taille"));
    }

    #[test]
    fn index_last_duplicate_wins() {
        let m = matcher();
        let index = m.index(&raw(&[("NOM", "A"), ("nom", "B")]));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("nom"), Some("nom"));
    }

    #[test]
    fn index_skips_labels_that_normalize_to_nothing() {
        let m = matcher();
        let index = m.index(&raw(&[("---", "x"), ("/Nom", "y")]));
        assert!(index.is_empty());
    }

    // ── match_field ──

    #[test]
    fn exact_match_beats_fuzzy() {
        let m = matcher();
        let index = m.index(&raw(&[("Nom complet", "Jean Dupont"), ("Nom", "Dupont")]));
        assert_eq!(m.match_field("Nom", &index), Some("Nom"));
    }

    #[test]
    fn exact_match_is_case_and_accent_insensitive() {
        let m = matcher();
        let index = m.index(&raw(&[("ÉTAT CIVIL", "Marié")]));
        assert_eq!(m.match_field("Etat civil", &index), Some("ÉTAT CIVIL"));
    }

    #[test]
    fn fuzzy_match_above_threshold() {
        let m = matcher();
        let index = m.index(&raw(&[("Date de naissance du patient", "01/02/1990")]));
        assert_eq!(
            m.match_field("Date de naissance", &index),
            Some("Date de naissance du patient")
        );
    }

    #[test]
    fn fuzzy_floor_yields_no_match() {
        let m = matcher();
        let index = m.index(&raw(&[("Adresse", "12 Rue X"), ("Profession", "Infirmier")]));
        assert_eq!(m.match_field("Groupe sanguin", &index), None);
    }

    #[test]
    fn fuzzy_picks_highest_score() {
        let m = matcher();
        let index = m.index(&raw(&[("Prénom du père", "Paul"), ("Prénoms", "Jean")]));
        assert_eq!(m.match_field("Prenom", &index), Some("Prénoms"));
    }

    #[test]
    fn fuzzy_tie_goes_to_first_key() {
        let m = matcher();
        // "abcx" and "abcy" both score 0.75 against "abcz"
        let index = m.index(&raw(&[("abcx", "1"), ("abcy", "2")]));
        assert_eq!(m.match_field("abcz", &index), Some("abcx"));
    }

    #[test]
    fn empty_index_matches_nothing() {
        let m = matcher();
        assert_eq!(m.match_field("Nom", &NormalizedKeyIndex::default()), None);
    }

    // ── match_all ──

    #[test]
    fn match_all_maps_query_keys_to_raw_values() {
        let m = matcher();
        let queries = vec![
            QueryKey { key: "Nom".into(), group_option: false },
            QueryKey { key: "Sexe: Homme".into(), group_option: true },
            QueryKey { key: "Groupe sanguin".into(), group_option: false },
        ];
        let response = raw(&[("NOM", "Dupont"), ("sexe : homme", "Oui"), ("Ville", "Lyon")]);

        let matched = m.match_all(&queries, &response);
        assert_eq!(matched.get("Nom"), Some("Dupont"));
        assert_eq!(matched.get("Sexe: Homme"), Some("Oui"));
        assert!(!matched.contains_key("Groupe sanguin"));
    }

    #[test]
    fn match_all_does_not_reuse_an_exact_match() {
        let m = matcher();
        let queries = vec![
            QueryKey { key: "Sexe: Homme".into(), group_option: true },
            QueryKey { key: "Sexe: Femme".into(), group_option: true },
        ];
        let response = raw(&[("Sexe: Homme", "Oui")]);

        // On its own "Sexe: Femme" fuzzy-matches the Homme key
        assert_eq!(
            m.match_field("Sexe: Femme", &m.index(&response)),
            Some("Sexe: Homme")
        );

        let matched = m.match_all(&queries, &response);
        assert_eq!(matched.get("Sexe: Homme"), Some("Oui"));
        assert!(!matched.contains_key("Sexe: Femme"));
    }

    #[test]
    fn match_all_fuzzy_claims_are_exclusive() {
        let m = matcher();
        let queries = vec![
            QueryKey { key: "Date de naissance".into(), group_option: false },
            QueryKey { key: "Date naissance".into(), group_option: false },
        ];
        let response = raw(&[("Date de naissance du patient", "01/02/1990")]);
        let matched = m.match_all(&queries, &response);
        assert_eq!(matched.get("Date de naissance"), Some("01/02/1990"));
        assert!(!matched.contains_key("Date naissance"));
    }

    #[test]
    fn match_all_never_falls_back_to_runner_up() {
        let m = matcher();
        let queries = vec![
            QueryKey { key: "Date de naissance".into(), group_option: false },
            QueryKey { key: "Date naissance".into(), group_option: false },
        ];
        let response = raw(&[
            ("Date de naissance du patient", "01/02/1990"),
            ("Date de deces", "-"),
            ("Lieu de naissance", "Lyon"),
        ]);

        // Both queries score highest against "Lieu de naissance"
        let index = m.index(&response);
        assert_eq!(m.match_field("Date de naissance", &index), Some("Lieu de naissance"));
        assert_eq!(m.match_field("Date naissance", &index), Some("Lieu de naissance"));

        let matched = m.match_all(&queries, &response);
        assert_eq!(matched.get("Date de naissance"), Some("Lyon"));
        assert!(!matched.contains_key("Date naissance"));
        assert_eq!(matched.len(), 1);
    }
}
