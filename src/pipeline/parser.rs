//! Parsers for the two response formats the vision model is asked for.
//!
//! - JSON mode: the first `{` to the last `}` is decoded strictly. No repair.
//! - Line mode: best-effort `Key: Value` extraction over markdown-ish text;
//!   unrecognized lines are dropped, never an error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::types::{RawResponseMap, NO, YES};
use super::ExtractionError;

/// `- **Key**: Value` or `- **Key:** Value`.
static BOLD_KEY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*+]\s*\*\*(.+?)(?::\*\*|\*\*\s*:)\s*(.*)$").unwrap()
});

/// One `"Key": value,` pair alone on its line, as left behind by truncated
/// pretty-printed JSON. The value is a single string or bare scalar.
static QUOTED_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"([^"]+)"\s*:\s*("(?:[^"\\]|\\.)*"|[^"{}\[\],]*?)\s*,?\s*$"#).unwrap()
});

/// `| Key | Value |`, trailing pipe optional, exactly two cells.
static TABLE_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|([^|]+)\|([^|]*)\|?\s*$").unwrap());

// ──────────────────────────────────────────────
// JSON mode
// ──────────────────────────────────────────────

/// A decoded JSON object with its keys in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonObject {
    fields: Vec<(String, Value)>,
}

impl JsonObject {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<'de> Deserialize<'de> for JsonObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = JsonObject;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<JsonObject, A::Error> {
                let mut fields = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    fields.push((k, v));
                }
                Ok(JsonObject { fields })
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

/// Decode the span from the first `{` to the last `}` in `text`.
///
/// Surrounding prose and code fences are ignored. A missing span is
/// `NoJsonFound`; a span that does not decode is `InvalidJson`.
pub fn extract_json_object(text: &str) -> Result<JsonObject, ExtractionError> {
    let start = text.find('{').ok_or(ExtractionError::NoJsonFound)?;
    let end = text.rfind('}').ok_or(ExtractionError::NoJsonFound)?;
    if end < start {
        return Err(ExtractionError::NoJsonFound);
    }

    serde_json::from_str(&text[start..=end])
        .map_err(|e| ExtractionError::InvalidJson(e.to_string()))
}

/// Flatten a decoded object into raw label/value strings.
///
/// Strings are trimmed, booleans become "Oui"/"Non", numbers keep their JSON
/// spelling, arrays of scalars are comma-joined, nested objects stay as JSON
/// text and `null` is treated as absent.
pub fn json_object_to_raw_map(object: &JsonObject) -> RawResponseMap {
    let mut map = RawResponseMap::new();
    for (key, value) in object.iter() {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(text) = value_to_text(value) {
            map.insert(key, text);
        }
    }
    map
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(true) => Some(YES.to_string()),
        Value::Bool(false) => Some(NO.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_to_text)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

// ──────────────────────────────────────────────
// Line mode
// ──────────────────────────────────────────────

/// Extract `Key: Value` pairs line by line.
///
/// Per line, tried in order: markdown bold key, two-cell table row, a lone
/// quoted JSON pair, plain `Key: Value` split on the first colon. Blank lines
/// and rules are skipped, as are lines that are JSON fragments. A repeated
/// key keeps its last value.
pub fn extract_key_value_lines(text: &str) -> RawResponseMap {
    let mut map = RawResponseMap::new();
    for line in text.lines() {
        if line.trim().is_empty() || is_rule_line(line) {
            continue;
        }
        if let Some((key, value)) = parse_line(line) {
            map.insert(key, value);
        }
    }
    map
}

fn parse_line(line: &str) -> Option<(String, String)> {
    if let Some(caps) = BOLD_KEY_LINE.captures(line) {
        return non_empty_pair(&caps[1], &caps[2]);
    }
    if let Some(caps) = TABLE_ROW.captures(line) {
        return non_empty_pair(&caps[1], &caps[2]);
    }
    if let Some(caps) = QUOTED_PAIR.captures(line) {
        let value = caps[2].trim();
        let value = if value.starts_with('"') {
            serde_json::from_str::<String>(value).unwrap_or_else(|_| value.trim_matches('"').to_string())
        } else {
            value.to_string()
        };
        return non_empty_pair(&caps[1], &value);
    }
    let (key, value) = line.split_once(':')?;
    let key = clean_plain_key(key);
    // Leftover JSON syntax is never a label
    if key.starts_with(['{', '[', '"']) {
        return None;
    }
    non_empty_pair(key, value)
}

fn non_empty_pair(key: &str, value: &str) -> Option<(String, String)> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Drop a leading bullet and surrounding emphasis from a plain key.
fn clean_plain_key(key: &str) -> &str {
    let key = key.trim();
    let key = key
        .strip_prefix("- ")
        .or_else(|| key.strip_prefix("* "))
        .unwrap_or(key);
    key.trim().trim_matches(|c| c == '*' || c == '_').trim()
}

/// Horizontal rules and table separators: `---`, `***`, `|---|:--:|`.
fn is_rule_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.chars().any(|c| matches!(c, '-' | '=' | '*' | '_'))
        && trimmed
            .chars()
            .all(|c| matches!(c, '-' | '=' | '*' | '_' | '|' | ':' | ' ' | '\t'))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── JSON mode ──

    #[test]
    fn json_embedded_in_prose() {
        let text = "Voici le résultat :\n```json\n{\"Nom\": \"Dupont\", \"Age\": \"42\"}\n```\nBonne journée.";
        let object = extract_json_object(text).unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object.get("Nom"), Some(&Value::String("Dupont".into())));
    }

    #[test]
    fn json_keeps_document_order() {
        let object = extract_json_object(r#"{"Zeta": "1", "Alpha": "2", "Mu": "3"}"#).unwrap();
        let keys: Vec<&str> = object.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Zeta", "Alpha", "Mu"]);
    }

    #[test]
    fn json_missing_braces() {
        assert!(matches!(
            extract_json_object("Je ne peux pas lire ce document."),
            Err(ExtractionError::NoJsonFound)
        ));
        assert!(matches!(
            extract_json_object("} reversed {"),
            Err(ExtractionError::NoJsonFound)
        ));
    }

    #[test]
    fn json_malformed_is_hard_failure() {
        let err = extract_json_object("{\"Nom\": \"Dupont\",}").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidJson(_)));
        assert!(err.is_parse_error());
    }

    #[test]
    fn json_greedy_span_rejects_two_objects() {
        // First `{` to last `}` spans both objects, which is not valid JSON
        let err = extract_json_object("{\"a\": \"1\"} puis {\"b\": \"2\"}").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidJson(_)));
    }

    #[test]
    fn json_values_flattened() {
        let object = extract_json_object(
            r#"{"Nom": "  Dupont ", "Fumeur": true, "Enceinte": false, "Age": 42, "Poids": null, "Allergies": ["pollen", "arachide"], "Adresse": {"ville": "Lyon"}, " ": "x"}"#,
        )
        .unwrap();
        let map = json_object_to_raw_map(&object);
        assert_eq!(map.get("Nom"), Some("Dupont"));
        assert_eq!(map.get("Fumeur"), Some("Oui"));
        assert_eq!(map.get("Enceinte"), Some("Non"));
        assert_eq!(map.get("Age"), Some("42"));
        assert!(!map.contains_key("Poids"));
        assert_eq!(map.get("Allergies"), Some("pollen, arachide"));
        assert_eq!(map.get("Adresse"), Some(r#"{"ville":"Lyon"}"#));
        assert_eq!(map.len(), 6);
    }

    // ── Line mode ──

    #[test]
    fn three_line_syntaxes_and_rule() {
        let map = extract_key_value_lines("- **Toux**: Oui\n| Fièvre | Non |\nAdresse: 12 Rue X\n---\n");
        let expected: RawResponseMap =
            vec![("Toux", "Oui"), ("Fièvre", "Non"), ("Adresse", "12 Rue X")]
                .into_iter()
                .collect();
        assert_eq!(map, expected);
    }

    #[test]
    fn bold_key_with_colon_inside() {
        let map = extract_key_value_lines("* **Date de naissance:** 01/02/1990");
        assert_eq!(map.get("Date de naissance"), Some("01/02/1990"));
    }

    #[test]
    fn first_colon_is_separator() {
        let map = extract_key_value_lines("Heure d'arrivée: 10:30");
        assert_eq!(map.get("Heure d'arrivée"), Some("10:30"));
    }

    #[test]
    fn table_row_without_trailing_pipe() {
        let map = extract_key_value_lines("| Toux | Oui");
        assert_eq!(map.get("Toux"), Some("Oui"));
    }

    #[test]
    fn table_separator_and_wide_rows_dropped() {
        let map = extract_key_value_lines("|---|---|\n| :--- | ---: |\n| a | b | c |\n");
        assert!(map.is_empty());
    }

    #[test]
    fn unmatched_lines_dropped() {
        let map = extract_key_value_lines("Formulaire d'admission\n\n```\n: orphan value\nNom: Dupont\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("Nom"), Some("Dupont"));
    }

    #[test]
    fn last_occurrence_wins() {
        let map = extract_key_value_lines("Toux: Non\nToux: Oui\n");
        assert_eq!(map.get("Toux"), Some("Oui"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn plain_key_loses_bullet_and_emphasis() {
        let map = extract_key_value_lines("- Nom: Dupont\n**Prénom**: Jean\n");
        assert_eq!(map.get("Nom"), Some("Dupont"));
        assert_eq!(map.get("Prénom"), Some("Jean"));
    }

    #[test]
    fn json_like_lines_are_unquoted() {
        let map = extract_key_value_lines(
            "{\n  \"Nom\": \"Dupont\",\n  \"Sexe: Homme\": \"Oui\",\n  \"Age\": 42\n",
        );
        assert_eq!(map.get("Nom"), Some("Dupont"));
        assert_eq!(map.get("Sexe: Homme"), Some("Oui"));
        assert_eq!(map.get("Age"), Some("42"));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn single_line_json_yields_no_pairs() {
        let map = extract_key_value_lines(
            r#"{"Nom": "Dupont", "Symptômes: Fièvre": "Oui", "Symptômes: Toux": "Non",}"#,
        );
        assert!(map.is_empty());
    }

    #[test]
    fn several_json_pairs_on_one_line_are_dropped() {
        let map = extract_key_value_lines("  \"Nom\": \"Dupont\", \"Age\": 42,\n  \"Ville\": \"Lyon\"\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("Ville"), Some("Lyon"));
    }

    #[test]
    fn quoted_value_escapes_decoded() {
        let map = extract_key_value_lines(r#"  "Remarques": "dit \"ça va\"","#);
        assert_eq!(map.get("Remarques"), Some(r#"dit "ça va""#));
    }

    #[test]
    fn empty_value_kept() {
        let map = extract_key_value_lines("Remarques:\n");
        assert_eq!(map.get("Remarques"), Some(""));
    }

    #[test]
    fn rule_detection() {
        assert!(is_rule_line("---"));
        assert!(is_rule_line(" * * * "));
        assert!(is_rule_line("|:---|---:|"));
        assert!(!is_rule_line("| a | b |"));
        assert!(!is_rule_line("::"));
    }
}
