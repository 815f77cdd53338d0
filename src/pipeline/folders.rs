//! Patient folder layout: discovering page images and splitting a flat scan
//! directory into `Patient_NNN/page_NN.ext` folders.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::resources::ResourceGuard;
use super::ExtractionError;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// One questionnaire's folder, produced by `prepare_patient_folders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientFolder {
    pub patient_dir: PathBuf,
    pub source_images: Vec<PathBuf>,
    /// 1-based.
    pub questionnaire_num: usize,
}

// ──────────────────────────────────────────────
// Natural ordering
// ──────────────────────────────────────────────

/// Sort key where digit runs compare by numeric value: "page2" < "page10".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalKey(Vec<NaturalPart>);

#[derive(Debug, Clone, PartialEq, Eq)]
enum NaturalPart {
    Text(String),
    /// Digits with leading zeros removed.
    Number(String),
}

impl PartialOrd for NaturalPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NaturalPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (NaturalPart::Number(a), NaturalPart::Number(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (NaturalPart::Text(a), NaturalPart::Text(b)) => a.cmp(b),
            (NaturalPart::Number(_), NaturalPart::Text(_)) => Ordering::Less,
            (NaturalPart::Text(_), NaturalPart::Number(_)) => Ordering::Greater,
        }
    }
}

/// Split `name` into alternating text and number runs.
pub fn natural_sort_key(name: &str) -> NaturalKey {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    for c in name.chars() {
        let is_digit = c.is_ascii_digit();
        if is_digit != in_digits && !current.is_empty() {
            parts.push(make_part(std::mem::take(&mut current), in_digits));
        }
        in_digits = is_digit;
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(make_part(current, in_digits));
    }
    NaturalKey(parts)
}

fn make_part(run: String, digits: bool) -> NaturalPart {
    if digits {
        let trimmed = run.trim_start_matches('0');
        NaturalPart::Number(trimmed.to_string())
    } else {
        NaturalPart::Text(run)
    }
}

// ──────────────────────────────────────────────
// Discovery
// ──────────────────────────────────────────────

fn is_page_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn sorted_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_page_image(p))
        .collect();
    images.sort_by_cached_key(|p| {
        natural_sort_key(&p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
    });
    Ok(images)
}

/// Page images (`.png`, `.jpg`, `.jpeg`, any case) of a patient folder in
/// natural filename order.
///
/// A missing or image-less folder is `NoImagesFound`.
pub fn list_page_images(dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
    let images = sorted_images(dir).map_err(|e| {
        tracing::debug!(dir = %dir.display(), error = %e, "Cannot read patient folder");
        ExtractionError::NoImagesFound(dir.to_path_buf())
    })?;
    if images.is_empty() {
        return Err(ExtractionError::NoImagesFound(dir.to_path_buf()));
    }
    Ok(images)
}

// ──────────────────────────────────────────────
// Preparation
// ──────────────────────────────────────────────

/// Copy a flat directory of scans into one folder per questionnaire.
///
/// Every `pages_per_questionnaire` consecutive images (natural order) go to
/// `output_dir/Patient_{n:03}/page_{i:02}{ext}`, keeping each source
/// extension. The last folder may hold fewer pages. A page that fails to copy
/// is logged and left out; resource pressure stops preparation.
pub fn prepare_patient_folders(
    source_dir: &Path,
    output_dir: &Path,
    pages_per_questionnaire: usize,
    guard: Option<&ResourceGuard>,
) -> Result<Vec<PatientFolder>, ExtractionError> {
    if pages_per_questionnaire == 0 {
        return Err(ExtractionError::Config(
            "pages per questionnaire must be at least 1".into(),
        ));
    }

    let images = sorted_images(source_dir)?;
    std::fs::create_dir_all(output_dir)?;

    let mut folders = Vec::new();
    for (chunk_idx, chunk) in images.chunks(pages_per_questionnaire).enumerate() {
        if let Some(guard) = guard {
            guard.check()?;
        }

        let questionnaire_num = chunk_idx + 1;
        let patient_dir = output_dir.join(format!("Patient_{questionnaire_num:03}"));
        std::fs::create_dir_all(&patient_dir)?;

        let mut source_images = Vec::with_capacity(chunk.len());
        for (idx, src) in chunk.iter().enumerate() {
            let ext = src
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let dest = patient_dir.join(format!("page_{:02}{ext}", idx + 1));
            match std::fs::copy(src, &dest) {
                Ok(_) => source_images.push(dest),
                Err(e) => {
                    tracing::warn!(src = %src.display(), error = %e, "Failed to copy page");
                }
            }
        }

        folders.push(PatientFolder {
            patient_dir,
            source_images,
            questionnaire_num,
        });
    }

    tracing::info!(
        source = %source_dir.display(),
        pages = images.len(),
        patients = folders.len(),
        "Patient folders prepared"
    );
    Ok(folders)
}
