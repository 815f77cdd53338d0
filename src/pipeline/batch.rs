//! Sequential multi-patient runs with cancellation and resource backpressure.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::orchestrator::Extractor;
use super::resources::ResourceGuard;
use super::types::{ExtractionRequest, ExtractionResult};

/// Event emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum BatchStatusEvent {
    Started {
        batch_id: Uuid,
        patient_count: usize,
    },
    Progress {
        completed: usize,
        total: usize,
        current_patient: String,
    },
    Completed {
        processed: usize,
        failed: usize,
        duration_ms: u64,
    },
    Cancelled {
        completed: usize,
    },
    Aborted {
        reason: String,
    },
}

/// One slot per input folder. `result` is `None` when the batch stopped
/// before reaching this patient.
#[derive(Debug, Clone, Serialize)]
pub struct PatientOutcome {
    pub patient_id: String,
    pub folder: PathBuf,
    pub result: Option<ExtractionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub patients: Vec<PatientOutcome>,
    /// Stopped by the cancellation flag.
    pub cancelled: bool,
    /// Stopped by resource pressure; the reason is kept.
    pub aborted: Option<String>,
}

impl BatchResult {
    pub fn processed(&self) -> usize {
        self.patients.iter().filter(|p| p.result.is_some()).count()
    }

    /// Processed patients whose result carries errors.
    pub fn failed(&self) -> usize {
        self.patients
            .iter()
            .filter_map(|p| p.result.as_ref())
            .filter(|r| !r.is_success())
            .count()
    }
}

pub struct BatchRunner {
    extractor: Extractor,
    guard: Option<ResourceGuard>,
    cancel: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            extractor,
            guard: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_resource_guard(mut self, guard: ResourceGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Shared flag; setting it stops the batch before the next patient.
    /// A model call already in flight is awaited.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Extract every folder in order.
    ///
    /// Patient failures stay inside their result. Only cancellation and
    /// resource pressure stop the batch, and both are reported.
    pub fn run(
        &self,
        folders: &[PathBuf],
        request: &ExtractionRequest,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) -> BatchResult {
        let start = Instant::now();
        let emit = |event: BatchStatusEvent| {
            if let Some(progress) = progress_fn {
                progress(event);
            }
        };

        let mut batch = BatchResult {
            batch_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 0,
            patients: folders
                .iter()
                .map(|folder| PatientOutcome {
                    patient_id: patient_id(folder),
                    folder: folder.clone(),
                    result: None,
                })
                .collect(),
            cancelled: false,
            aborted: None,
        };
        let total = folders.len();

        tracing::info!(batch_id = %batch.batch_id, patients = total, "Batch started");
        emit(BatchStatusEvent::Started {
            batch_id: batch.batch_id,
            patient_count: total,
        });

        for (i, slot) in batch.patients.iter_mut().enumerate() {
            if self.is_cancelled() {
                tracing::info!(completed = i, "Batch cancelled");
                batch.cancelled = true;
                emit(BatchStatusEvent::Cancelled { completed: i });
                break;
            }
            if let Some(guard) = &self.guard {
                if let Err(e) = guard.check() {
                    tracing::error!(completed = i, error = %e, "Batch aborted");
                    batch.aborted = Some(e.to_string());
                    emit(BatchStatusEvent::Aborted {
                        reason: e.to_string(),
                    });
                    break;
                }
            }

            emit(BatchStatusEvent::Progress {
                completed: i,
                total,
                current_patient: slot.patient_id.clone(),
            });
            slot.result = Some(self.extractor.extract_patient_folder(&slot.folder, request));
        }

        batch.duration_ms = start.elapsed().as_millis() as u64;
        if !batch.cancelled && batch.aborted.is_none() {
            emit(BatchStatusEvent::Completed {
                processed: batch.processed(),
                failed: batch.failed(),
                duration_ms: batch.duration_ms,
            });
        }
        tracing::info!(
            batch_id = %batch.batch_id,
            processed = batch.processed(),
            failed = batch.failed(),
            duration_ms = batch.duration_ms,
            "Batch finished"
        );
        batch
    }
}

fn patient_id(folder: &Path) -> String {
    folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string())
}
