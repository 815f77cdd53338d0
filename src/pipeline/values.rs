//! Checkbox value normalization.
//!
//! Raw answers that look like a checked or unchecked box become "Oui"/"Non",
//! but only for variables known to be boolean. Anything else passes through,
//! so a postal code of "1" or a coded answer of "0" stays as written.

use std::collections::HashSet;

use super::normalize::LabelNormalizer;
use super::types::{NO, YES};

/// Values read as a checked box (compared lowercase, whole string).
const CHECKED: &[&str] = &[
    "oui", "yes", "[x]", "☑", "☒", "✓", "✔", "■", "▣", "●", "◉", "1", "✗", "✘",
];

/// Values read as an empty box.
const UNCHECKED: &[&str] = &["non", "no", "0", "[ ]", "[]", "☐", "□", "○", "◯"];

pub struct ValueNormalizer {
    normalizer: LabelNormalizer,
    boolean_fields: HashSet<String>,
}

impl ValueNormalizer {
    /// `boolean_fields` is the allowlist of variable names; names are compared
    /// after label normalization.
    pub fn new(normalizer: LabelNormalizer, boolean_fields: &[String]) -> Self {
        let boolean_fields = boolean_fields
            .iter()
            .map(|f| normalizer.normalize(f))
            .filter(|f| !f.is_empty())
            .collect();
        Self {
            normalizer,
            boolean_fields,
        }
    }

    pub fn is_boolean_field(&self, name: &str) -> bool {
        self.boolean_fields.contains(&self.normalizer.normalize(name))
    }

    /// Canonical value for `raw`. Coercion only applies to boolean fields.
    pub fn normalize(&self, raw: &str, is_boolean_field: bool) -> String {
        match coerce_checkbox(raw) {
            Some(canonical) if is_boolean_field => canonical.to_string(),
            _ => raw.to_string(),
        }
    }
}

/// "Oui"/"Non" when `value` is in one of the glyph vocabularies.
pub fn coerce_checkbox(value: &str) -> Option<&'static str> {
    let lowered = value.trim().to_lowercase();
    if CHECKED.contains(&lowered.as_str()) {
        Some(YES)
    } else if UNCHECKED.contains(&lowered.as_str()) {
        Some(NO)
    } else {
        None
    }
}
