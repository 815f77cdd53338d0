use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use autoquest_lib::config::{self, PipelineConfig, ReconciliationStrategy};
use autoquest_lib::pipeline::{
    detect_variables, natural_sort_key, parse_schema, prepare_patient_folders, BatchRunner,
    BatchStatusEvent, ExtractionError, Extractor, HttpVisionClient, ResourceGuard,
};

#[derive(Parser, Debug)]
#[command(name = "autoquest", version)]
#[command(about = "Scanned questionnaire extraction with a remote vision model", long_about = None)]
struct Cli {
    /// Config file (default: ~/AutoQuest/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the vision endpoint from the config
    #[arg(long, global = true, value_name = "URL")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a directory of scans into Patient_NNN folders
    Prepare {
        #[arg(value_name = "SOURCE_DIR")]
        source: PathBuf,

        #[arg(value_name = "OUTPUT_DIR")]
        output: PathBuf,

        /// Pages belonging to one questionnaire
        #[arg(short = 'n', long, default_value_t = 1)]
        pages_per_questionnaire: usize,
    },

    /// Ask the model which fields a questionnaire contains
    Detect {
        #[arg(value_name = "PATIENT_DIR")]
        folder: PathBuf,

        /// Write JSON here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Extract schema variables from patient folders
    Extract {
        /// Variable schema (JSON list of names or {name, type, options})
        #[arg(long, value_name = "FILE")]
        schema: PathBuf,

        /// Patient folders to process, in order
        #[arg(value_name = "PATIENT_DIR", required_unless_present = "patients_dir")]
        folders: Vec<PathBuf>,

        /// Process every subdirectory of this directory instead
        #[arg(long, value_name = "DIR", conflicts_with = "folders")]
        patients_dir: Option<PathBuf>,

        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Write JSON here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Json,
    JsonWithLineFallback,
    Lines,
}

impl From<StrategyArg> for ReconciliationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Json => ReconciliationStrategy::Json,
            StrategyArg::JsonWithLineFallback => ReconciliationStrategy::JsonWithLineFallback,
            StrategyArg::Lines => ReconciliationStrategy::Lines,
        }
    }
}

fn main() -> ExitCode {
    autoquest_lib::init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "autoquest failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, ExtractionError> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint_url = endpoint;
    }

    match cli.command {
        Command::Prepare {
            source,
            output,
            pages_per_questionnaire,
        } => {
            let guard = ResourceGuard::from_config(&config);
            let folders =
                prepare_patient_folders(&source, &output, pages_per_questionnaire, Some(&guard))?;
            write_json(&folders, None)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Detect { folder, output } => {
            let extractor = build_extractor(&config)?;
            let result = detect_variables(&extractor, &folder);
            write_json(&result, output.as_deref())?;
            Ok(exit_code(result.errors.is_empty()))
        }

        Command::Extract {
            schema,
            folders,
            patients_dir,
            strategy,
            output,
        } => {
            if let Some(strategy) = strategy {
                config.strategy = strategy.into();
            }
            let request = parse_schema(&std::fs::read_to_string(&schema)?)?;
            let folders = match patients_dir {
                Some(dir) => list_subdirectories(&dir)?,
                None => folders,
            };

            let runner = BatchRunner::new(build_extractor(&config)?)
                .with_resource_guard(ResourceGuard::from_config(&config));
            let log_progress: &dyn Fn(BatchStatusEvent) = &|event| {
                if let BatchStatusEvent::Progress {
                    completed,
                    total,
                    current_patient,
                } = event
                {
                    tracing::info!(patient = %current_patient, "[{}/{}]", completed + 1, total);
                }
            };
            let batch = runner.run(&folders, &request, Some(log_progress));
            write_json(&batch, output.as_deref())?;

            if let Some(reason) = &batch.aborted {
                tracing::error!(reason = %reason, "Batch aborted before completion");
            }
            Ok(exit_code(batch.aborted.is_none() && batch.failed() == 0))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ExtractionError> {
    match path.map(Path::to_path_buf).or_else(config::default_config_path) {
        Some(path) => PipelineConfig::load(&path),
        None => Ok(PipelineConfig::default()),
    }
}

fn build_extractor(config: &PipelineConfig) -> Result<Extractor, ExtractionError> {
    let client = HttpVisionClient::new(config)?;
    Ok(Extractor::new(config, Arc::new(client)))
}

/// Subdirectories of `dir` in natural name order.
fn list_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort_by_cached_key(|p| {
        natural_sort_key(&p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
    });
    Ok(dirs)
}

/// Pretty JSON to stdout, or atomically replace `path`.
fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<(), ExtractionError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ExtractionError::Config(format!("cannot serialize output: {e}")))?;

    let Some(path) = path else {
        println!("{json}");
        return Ok(());
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    tracing::info!(path = %path.display(), "Results written");
    Ok(())
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
