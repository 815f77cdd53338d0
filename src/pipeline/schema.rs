//! Variable schema loading, with migration of legacy plain-string lists.
//!
//! Older projects stored variables as bare names (`["Nom", "Age"]`); newer
//! ones store records (`{"name", "type", "options"}`). Both shapes, and a mix
//! of them, are accepted and unified into `VariableSpec` once, here.

use serde::Deserialize;

use super::types::{ExtractionRequest, VariableKind, VariableSpec};
use super::ExtractionError;

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredVariable {
    Name(String),
    Spec(VariableSpec),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSchema {
    List(Vec<StoredVariable>),
    Project { variables: Vec<StoredVariable> },
}

/// Parse a schema document into a validated `ExtractionRequest`.
///
/// Accepts a JSON array or an object with a `variables` array.
pub fn parse_schema(json: &str) -> Result<ExtractionRequest, ExtractionError> {
    let stored: StoredSchema = serde_json::from_str(json)
        .map_err(|e| ExtractionError::InvalidSchema(format!("unreadable schema: {e}")))?;

    let items = match stored {
        StoredSchema::List(items) => items,
        StoredSchema::Project { variables } => variables,
    };

    let mut migrated = 0usize;
    let variables: Vec<VariableSpec> = items
        .into_iter()
        .map(|item| match item {
            StoredVariable::Name(name) => {
                migrated += 1;
                VariableSpec::text(name.trim())
            }
            StoredVariable::Spec(spec) => clean_spec(spec),
        })
        .collect();

    if migrated > 0 {
        tracing::info!(migrated, "Migrated legacy plain-string variables to text variables");
    }

    ExtractionRequest::new(variables)
}

/// Trim the name and options, dropping blank options.
fn clean_spec(spec: VariableSpec) -> VariableSpec {
    let options = match spec.kind {
        VariableKind::Group => spec
            .options
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
        VariableKind::Text => vec![],
    };
    VariableSpec {
        name: spec.name.trim().to_string(),
        kind: spec.kind,
        options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_plain_strings() {
        let request = parse_schema(r#"["Nom", " Date de naissance "]"#).unwrap();
        assert_eq!(request.variables().len(), 2);
        assert_eq!(request.variables()[1].name, "Date de naissance");
        assert!(request.variables().iter().all(|v| !v.is_group()));
    }

    #[test]
    fn accepts_mixed_list() {
        let request = parse_schema(
            r#"["Nom", {"name": "Sexe", "type": "group", "options": ["Homme", " Femme ", ""]}]"#,
        )
        .unwrap();
        let sexe = &request.variables()[1];
        assert!(sexe.is_group());
        assert_eq!(sexe.options, vec!["Homme", "Femme"]);
        assert_eq!(request.query_keys(), vec!["Nom", "Sexe: Homme", "Sexe: Femme"]);
    }

    #[test]
    fn accepts_project_document() {
        let request = parse_schema(
            r#"{"variables": [{"name": "Toux", "type": "text", "options": []}], "extracted_data": {}}"#,
        )
        .unwrap();
        assert_eq!(request.variables()[0].name, "Toux");
    }

    #[test]
    fn text_options_are_discarded() {
        let request =
            parse_schema(r#"[{"name": "Nom", "type": "text", "options": ["stray"]}]"#).unwrap();
        assert!(request.variables()[0].options.is_empty());
    }

    #[test]
    fn group_with_only_blank_options_is_rejected() {
        let err = parse_schema(r#"[{"name": "Sexe", "type": "group", "options": [" "]}]"#)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidSchema(_)));
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(parse_schema("{not json").is_err());
        assert!(parse_schema(r#"{"name": "Nom"}"#).is_err());
    }
}
