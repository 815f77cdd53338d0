pub mod types;
pub mod schema;
pub mod folders;
pub mod merge;
pub mod prompt;
pub mod parser;
pub mod normalize;
pub mod matcher;
pub mod values;
pub mod consolidate;
pub mod gateway;
pub mod resources;
pub mod orchestrator;
pub mod detect;
pub mod batch;

pub use types::*;
pub use schema::parse_schema;
pub use folders::{list_page_images, natural_sort_key, prepare_patient_folders, NaturalKey, PatientFolder};
pub use merge::{ImageMerger, MergedImage};
pub use prompt::{build_detection_prompt, build_json_prompt, build_line_prompt};
pub use parser::{extract_json_object, extract_key_value_lines, json_object_to_raw_map, JsonObject};
pub use normalize::LabelNormalizer;
pub use matcher::{similarity_ratio, FieldMatcher, NormalizedKeyIndex};
pub use values::ValueNormalizer;
pub use consolidate::consolidate;
pub use gateway::{GatewayError, HttpVisionClient, MockVisionClient, RetryPolicy, VisionClient};
pub use resources::{
    FixedResourceMonitor, ProcResourceMonitor, ResourceGuard, ResourceLimits, ResourceMonitor,
    ResourceSnapshot,
};
pub use orchestrator::Extractor;
pub use detect::{detect_variables, DetectionResult};
pub use batch::{BatchResult, BatchRunner, BatchStatusEvent, PatientOutcome};

use std::path::PathBuf;

use thiserror::Error;

/// Per-patient pipeline failures. Everything here is caught at the patient
/// boundary and recorded in `ExtractionResult::errors`, except
/// `ResourcePressure`, which stops a batch.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("No image found in folder: {0}")]
    NoImagesFound(PathBuf),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Vision model error: {0}")]
    RemoteCallFailed(String),

    #[error("No JSON object found in the model response")]
    NoJsonFound,

    #[error("Model response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid variable schema: {0}")]
    InvalidSchema(String),

    #[error("System resources exhausted: {0}")]
    ResourcePressure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GatewayError> for ExtractionError {
    fn from(e: GatewayError) -> Self {
        ExtractionError::RemoteCallFailed(e.to_string())
    }
}

impl ExtractionError {
    /// JSON-mode parse failures, the ones a line-based reparse can recover from.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, ExtractionError::NoJsonFound | ExtractionError::InvalidJson(_))
    }
}
