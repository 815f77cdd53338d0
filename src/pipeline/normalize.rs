//! Label canonicalization for matching model output against the schema.
//!
//! Normalized labels are only ever compared, never displayed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::LabelCorrection;

/// Innermost parenthesized span. Applied until no match remains so nested
/// parentheses collapse from the inside out.
static PARENTHESIZED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^()]*\)").unwrap());

/// Canonicalizes field labels: case, accents, parentheticals, punctuation,
/// whitespace, then a table of known misspellings.
///
/// Pure and idempotent: `normalize(normalize(x)) == normalize(x)`.
#[derive(Debug, Clone, Default)]
pub struct LabelNormalizer {
    corrections: HashMap<String, String>,
}

impl LabelNormalizer {
    /// Build from a correction table. Entries are normalized themselves;
    /// entries that would break idempotence (an empty or multi-word `from`,
    /// or a `to` containing another `from` word) are skipped with a warning.
    pub fn new(table: &[LabelCorrection]) -> Self {
        let mut corrections = HashMap::new();
        for entry in table {
            let from = canonicalize(&entry.from);
            let to = canonicalize(&entry.to);
            if from.is_empty() || from.contains(' ') || to.is_empty() {
                tracing::warn!(from = %entry.from, to = %entry.to, "Ignoring unusable label correction");
                continue;
            }
            corrections.insert(from, to);
        }

        let chained: Vec<String> = corrections
            .iter()
            .filter(|(_, to)| to.split(' ').any(|w| corrections.contains_key(w)))
            .map(|(from, _)| from.clone())
            .collect();
        for from in chained {
            tracing::warn!(from = %from, "Ignoring chained label correction");
            corrections.remove(&from);
        }

        Self { corrections }
    }

    pub fn normalize(&self, label: &str) -> String {
        let base = canonicalize(label);
        if self.corrections.is_empty() {
            return base;
        }
        base.split(' ')
            .map(|word| self.corrections.get(word).map(String::as_str).unwrap_or(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything except the correction table.
fn canonicalize(label: &str) -> String {
    let lowered = label.to_lowercase();

    let unaccented: String = expand_ligatures(&lowered)
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    let mut without_parens = unaccented;
    while PARENTHESIZED.is_match(&without_parens) {
        without_parens = PARENTHESIZED.replace_all(&without_parens, " ").into_owned();
    }

    let cleaned: String = without_parens
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ligatures have no canonical decomposition; spell them out.
fn expand_ligatures(text: &str) -> String {
    if !text.contains(['œ', 'æ', 'ß']) {
        return text.to_string();
    }
    text.replace('œ', "oe").replace('æ', "ae").replace('ß', "ss")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_normalizer() -> LabelNormalizer {
        LabelNormalizer::new(&crate::config::PipelineConfig::default().label_corrections)
    }

    #[test]
    fn case_insensitive() {
        let n = default_normalizer();
        assert_eq!(n.normalize("Date de Naissance"), n.normalize("date de naissance"));
        assert_eq!(n.normalize("Date de Naissance"), "date de naissance");
    }

    #[test]
    fn accent_insensitive() {
        let n = default_normalizer();
        assert_eq!(n.normalize("État"), n.normalize("Etat"));
        assert_eq!(n.normalize("Fièvre"), "fievre");
        assert_eq!(n.normalize("Symptômes: Fièvre"), "symptomes fievre");
    }

    #[test]
    fn removes_parenthesized_text() {
        let n = default_normalizer();
        assert_eq!(n.normalize("Poids (kg)"), "poids");
        assert_eq!(n.normalize("Taille (en cm (approx))"), "taille");
        assert_eq!(n.normalize("Age (ans) du patient"), "age du patient");
    }

    #[test]
    fn punctuation_becomes_single_space() {
        let n = default_normalizer();
        assert_eq!(n.normalize("  N°  d'identification -- patient: "), "n d identification patient");
        assert_eq!(n.normalize("Code_Postal"), "code postal");
    }

    #[test]
    fn unbalanced_parenthesis_is_treated_as_punctuation() {
        let n = default_normalizer();
        assert_eq!(n.normalize("Poids (kg"), "poids kg");
    }

    #[test]
    fn ligatures_expanded() {
        let n = default_normalizer();
        assert_eq!(n.normalize("Nombre de sœurs"), "nombre de soeurs");
    }

    #[test]
    fn applies_correction_table() {
        let n = default_normalizer();
        assert_eq!(n.normalize("Provnce"), "province");
        assert_eq!(n.normalize("Distric sanitaire"), "district sanitaire");
        assert_eq!(n.normalize("Maladi chronique"), "maladie chronique");
        // Only whole words are corrected
        assert_eq!(n.normalize("Maladies"), "maladies");
    }

    #[test]
    fn idempotent() {
        let n = default_normalizer();
        let samples = [
            "Date de Naissance",
            "  État (civil) / Situation ",
            "Provnce",
            "Symptômes: Fièvre",
            "**Toux**",
            "| Fièvre |",
            "",
            "((()))",
            "Œdème (membres inférieurs)",
            "N° 12-B",
        ];
        for s in samples {
            let once = n.normalize(s);
            assert_eq!(n.normalize(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn correction_entries_are_normalized() {
        let n = LabelNormalizer::new(&[LabelCorrection::new("Éta", "État")]);
        assert_eq!(n.normalize("eta civil"), "etat civil");
    }

    #[test]
    fn chained_corrections_are_dropped() {
        let n = LabelNormalizer::new(&[
            LabelCorrection::new("aa", "bb"),
            LabelCorrection::new("bb", "cc"),
        ]);
        let once = n.normalize("aa");
        assert_eq!(n.normalize(&once), once);
        assert_eq!(n.normalize("bb"), "cc");
    }

    #[test]
    fn empty_table_is_plain_canonicalization() {
        let n = LabelNormalizer::default();
        assert_eq!(n.normalize("Provnce"), "provnce");
    }
}
