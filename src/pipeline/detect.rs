//! Variable detection: ask the model which fields a questionnaire has, to
//! seed a schema.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::info_span;

use super::orchestrator::Extractor;
use super::parser::extract_json_object;
use super::prompt::build_detection_prompt;
use super::ExtractionError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionResult {
    /// Field labels in document order, deduplicated.
    pub variables: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Merge the pages of `folder` and ask the model for its field labels.
///
/// Like extraction, failures end up in `errors` rather than being returned.
pub fn detect_variables(extractor: &Extractor, folder: &Path) -> DetectionResult {
    let span = info_span!("detect_variables", folder = %folder.display());
    let _enter = span.enter();

    let mut result = DetectionResult::default();
    match run(extractor, folder, &mut result.warnings) {
        Ok(variables) => {
            tracing::info!(count = variables.len(), "Variables detected");
            result.variables = variables;
        }
        Err(e) => {
            tracing::error!(error = %e, "Variable detection failed");
            result.errors.push(e.to_string());
        }
    }
    result
}

fn run(
    extractor: &Extractor,
    folder: &Path,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, ExtractionError> {
    let merged = extractor.merge_folder(folder)?;
    let raw = extractor.call_model(&build_detection_prompt(), &merged)?;
    let object = extract_json_object(&raw)?;

    let Some(Value::Array(items)) = object.get("variables") else {
        return Err(ExtractionError::InvalidJson(
            "expected a \"variables\" list".into(),
        ));
    };
    Ok(collect_labels(items, warnings))
}

/// Trimmed, non-empty, unique string labels. Anything else is skipped with
/// a warning.
fn collect_labels(items: &[Value], warnings: &mut Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut labels = Vec::new();
    for item in items {
        let Some(label) = item.as_str().map(str::trim) else {
            warnings.push(format!("Ignored non-text variable entry: {item}"));
            continue;
        };
        if label.is_empty() {
            continue;
        }
        if !seen.insert(label.to_string()) {
            warnings.push(format!("Duplicate variable '{label}' ignored"));
            continue;
        }
        labels.push(label.to_string());
    }
    labels
}
