use std::path::Path;
use std::sync::Arc;

use tracing::info_span;

use super::consolidate::consolidate;
use super::folders::list_page_images;
use super::gateway::VisionClient;
use super::matcher::FieldMatcher;
use super::merge::{ImageMerger, MergedImage};
use super::normalize::LabelNormalizer;
use super::parser::{extract_json_object, extract_key_value_lines, json_object_to_raw_map};
use super::prompt::{build_json_prompt, build_line_prompt};
use super::types::{ExtractionRequest, ExtractionResult, FieldMap, PageRecord, RawResponseMap};
use super::values::ValueNormalizer;
use super::ExtractionError;
use crate::config::{PipelineConfig, ReconciliationStrategy};

/// Marker a gateway puts in front of its text when it gave up.
const REMOTE_ERROR_MARKER: &str = "ERROR";

const MERGED_FILENAME: &str = "MERGED_IMAGE";
const MERGED_PATH: &str = "MERGED_VIRTUAL";

/// Runs one patient folder through the pipeline:
/// list pages → merge → prompt → model → parse → match → normalize → consolidate.
pub struct Extractor {
    client: Arc<dyn VisionClient>,
    merger: ImageMerger,
    matcher: FieldMatcher,
    values: ValueNormalizer,
    strategy: ReconciliationStrategy,
}

impl Extractor {
    pub fn new(config: &PipelineConfig, client: Arc<dyn VisionClient>) -> Self {
        let normalizer = LabelNormalizer::new(&config.label_corrections);
        Self {
            client,
            merger: ImageMerger::from_config(config),
            values: ValueNormalizer::new(normalizer.clone(), &config.boolean_fields),
            matcher: FieldMatcher::new(normalizer, config.fuzzy_match_threshold),
            strategy: config.strategy,
        }
    }

    /// Extract `request` from the pages in `folder`.
    ///
    /// Never fails: any error is recorded in the result's `errors` and the
    /// variables are left empty.
    pub fn extract_patient_folder(&self, folder: &Path, request: &ExtractionRequest) -> ExtractionResult {
        let span = info_span!("extract_patient", folder = %folder.display(), strategy = ?self.strategy);
        let _enter = span.enter();

        let mut result = ExtractionResult::default();
        match self.run(folder, request, &mut result.warnings) {
            Ok((variables, raw_text)) => {
                let structured = serde_json::to_string(&variables).unwrap_or_default();
                result.pages.push(PageRecord {
                    filename: MERGED_FILENAME.to_string(),
                    text: raw_text,
                    structured,
                    path: MERGED_PATH.to_string(),
                });
                tracing::info!(
                    variables = variables.len(),
                    warnings = result.warnings.len(),
                    "Patient extracted"
                );
                result.variables = variables;
            }
            Err(e) => {
                tracing::error!(error = %e, "Patient extraction failed");
                result.errors.push(e.to_string());
            }
        }
        result
    }

    fn run(
        &self,
        folder: &Path,
        request: &ExtractionRequest,
        warnings: &mut Vec<String>,
    ) -> Result<(FieldMap, String), ExtractionError> {
        let merged = self.merge_folder(folder)?;

        let prompt = match self.strategy {
            ReconciliationStrategy::Lines => build_line_prompt(),
            _ => build_json_prompt(&request.query_keys()),
        };
        let raw_text = self.call_model(&prompt, &merged)?;

        let raw = self.parse_response(&raw_text, warnings)?;
        let answers = self.reconcile(&raw, request);
        let variables = consolidate(&answers, request.variables(), warnings);
        Ok((variables, raw_text))
    }

    /// All page images of `folder`, merged and encoded.
    pub fn merge_folder(&self, folder: &Path) -> Result<MergedImage, ExtractionError> {
        let pages = list_page_images(folder)?;
        tracing::debug!(pages = pages.len(), "Merging pages");
        self.merger.merge(&pages)
    }

    /// One model call. A response carrying the gateway's error marker is a
    /// failure, same as a transport error.
    pub fn call_model(&self, prompt: &str, image: &MergedImage) -> Result<String, ExtractionError> {
        let text = self.client.generate(prompt, &image.to_base64())?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ExtractionError::RemoteCallFailed("empty model response".into()));
        }
        if trimmed.starts_with(REMOTE_ERROR_MARKER) {
            return Err(ExtractionError::RemoteCallFailed(trimmed.to_string()));
        }
        tracing::debug!(raw = %trimmed, "Model response");
        Ok(trimmed.to_string())
    }

    fn parse_response(
        &self,
        text: &str,
        warnings: &mut Vec<String>,
    ) -> Result<RawResponseMap, ExtractionError> {
        match self.strategy {
            ReconciliationStrategy::Json => Ok(json_object_to_raw_map(&extract_json_object(text)?)),
            ReconciliationStrategy::Lines => Ok(extract_key_value_lines(text)),
            ReconciliationStrategy::JsonWithLineFallback => match extract_json_object(text) {
                Ok(object) => Ok(json_object_to_raw_map(&object)),
                Err(e) if e.is_parse_error() => {
                    let lines = extract_key_value_lines(text);
                    if lines.is_empty() {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, recovered = lines.len(), "JSON parse failed, using line format");
                    warnings.push(format!(
                        "{e}; recovered {} field(s) from line format",
                        lines.len()
                    ));
                    Ok(lines)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Match every query key against the raw labels and normalize the
    /// matched values. Group sub-questions are always yes/no.
    pub fn reconcile(&self, raw: &RawResponseMap, request: &ExtractionRequest) -> FieldMap {
        let matched = self.matcher.match_all(request.queries(), raw);
        let mut answers = FieldMap::new();
        for query in request.queries() {
            if let Some(value) = matched.get(&query.key) {
                let is_boolean = query.group_option || self.values.is_boolean_field(&query.key);
                answers.insert(query.key.clone(), self.values.normalize(value, is_boolean));
            }
        }
        answers
    }
}
