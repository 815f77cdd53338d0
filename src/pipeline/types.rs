use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ExtractionError;

/// Sentinel for a variable the model did not answer. Never treat it as data.
pub const NOT_PROVIDED: &str = "Non renseigné";

/// Canonical checked value.
pub const YES: &str = "Oui";

/// Canonical unchecked value.
pub const NO: &str = "Non";

/// Separator between a group name and one of its options in a query key.
pub const GROUP_OPTION_SEPARATOR: &str = ": ";

// ──────────────────────────────────────────────
// Variable schema
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Free text or a single checkbox.
    Text,
    /// Exclusive choice between named options.
    Group,
}

/// A variable the user wants extracted from every questionnaire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: VariableKind,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_kind() -> VariableKind {
    VariableKind::Text
}

impl VariableSpec {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: VariableKind::Text,
            options: vec![],
        }
    }

    pub fn group(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: VariableKind::Group,
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == VariableKind::Group
    }

    /// Query key for one option of a group variable: `"{name}: {option}"`.
    pub fn option_key(&self, option: &str) -> String {
        format!("{}{GROUP_OPTION_SEPARATOR}{option}", self.name)
    }
}

/// One entry of the flat list actually sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    pub key: String,
    /// Set for group sub-questions, which are always yes/no.
    pub group_option: bool,
}

/// Validated schema plus its expanded query list.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    variables: Vec<VariableSpec>,
    queries: Vec<QueryKey>,
}

impl ExtractionRequest {
    /// Validate the schema and expand group variables into one query per option.
    ///
    /// Names must be non-empty and unique (case-sensitive); a group needs at
    /// least one option and a text variable none.
    pub fn new(variables: Vec<VariableSpec>) -> Result<Self, ExtractionError> {
        let mut seen = std::collections::HashSet::new();
        for var in &variables {
            if var.name.trim().is_empty() {
                return Err(ExtractionError::InvalidSchema(
                    "variable name cannot be empty".into(),
                ));
            }
            if !seen.insert(var.name.as_str()) {
                return Err(ExtractionError::InvalidSchema(format!(
                    "duplicate variable name '{}'",
                    var.name
                )));
            }
            match var.kind {
                VariableKind::Group if var.options.is_empty() => {
                    return Err(ExtractionError::InvalidSchema(format!(
                        "group '{}' has no options",
                        var.name
                    )));
                }
                VariableKind::Text if !var.options.is_empty() => {
                    return Err(ExtractionError::InvalidSchema(format!(
                        "text variable '{}' cannot have options",
                        var.name
                    )));
                }
                _ => {}
            }
        }

        let queries = variables
            .iter()
            .flat_map(|var| match var.kind {
                VariableKind::Text => vec![QueryKey {
                    key: var.name.clone(),
                    group_option: false,
                }],
                VariableKind::Group => var
                    .options
                    .iter()
                    .map(|opt| QueryKey {
                        key: var.option_key(opt),
                        group_option: true,
                    })
                    .collect(),
            })
            .collect();

        Ok(Self { variables, queries })
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub fn queries(&self) -> &[QueryKey] {
        &self.queries
    }

    /// The expanded keys, in schema order.
    pub fn query_keys(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.key.clone()).collect()
    }
}

// ──────────────────────────────────────────────
// FieldMap
// ──────────────────────────────────────────────

/// String-to-string map that keeps first-insertion order.
///
/// Re-inserting an existing key overwrites the value in place, so the last
/// occurrence wins while the key keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

/// Label/value pairs exactly as the model produced them.
pub type RawResponseMap = FieldMap;

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&pos| self.entries[pos].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldMapVisitor;

        impl<'de> Visitor<'de> for FieldMapVisitor {
            type Value = FieldMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
                let mut map = FieldMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(FieldMapVisitor)
    }
}

// ──────────────────────────────────────────────
// Results
// ──────────────────────────────────────────────

/// Debug record for the image that was sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub filename: String,
    /// Raw model response.
    pub text: String,
    /// Final variables, serialized as JSON.
    pub structured: String,
    pub path: String,
}

/// Outcome of one patient-folder extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub variables: FieldMap,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub pages: Vec<PageRecord>,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}
