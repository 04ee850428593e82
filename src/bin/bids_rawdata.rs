use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bids_rawdata::app::{App, ProgressSink, quarantine_job};
use bids_rawdata::config::{JobLoader, SettingsLoader};
use bids_rawdata::convert::{Converter, SystemConverter, ToolStatus};
use bids_rawdata::domain::SourceFormat;
use bids_rawdata::error::BidsError;
use bids_rawdata::manifest::Manifest;
use bids_rawdata::output::{DetectReport, JsonOutput, LogSink, ManifestReport, ValidateReport};
use bids_rawdata::store::detect_format;
use bids_rawdata::validator;

#[derive(Parser)]
#[command(name = "bids-rawdata")]
#[command(about = "Convert DICOM, PAR/REC and NIfTI drops into a BIDS-style rawdata tree")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one job end to end")]
    Run(RunArgs),
    #[command(about = "Write the file manifest of a directory")]
    Manifest(ManifestArgs),
    #[command(about = "Group manifested files into validated sets")]
    Validate(ValidateArgs),
    #[command(about = "Detect the source format of a manifested directory")]
    Detect(DetectArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    job: PathBuf,

    /// Input drop; defaults to `upload_dir/<user>/<uploadTime>` from settings.
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    settings: Option<PathBuf>,

    /// Where a failed job file is moved, with an error log next to it.
    #[arg(long)]
    error_dir: Option<PathBuf>,

    /// Suppress progress lines; only the final report is printed.
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct ManifestArgs {
    dir: PathBuf,

    #[arg(long)]
    recursive: bool,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long, value_enum)]
    format: SourceFormat,

    invalid_dir: PathBuf,

    valid_dir: PathBuf,
}

#[derive(Args)]
struct DetectArgs {
    dir: PathBuf,
}

/// Set when a job finished but some of its sets failed to convert.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{failed} of {total} sets failed to convert")]
struct PartialFailure {
    failed: usize,
    total: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<BidsError>() {
            return ExitCode::from(map_exit_code(err));
        }
        if report.downcast_ref::<PartialFailure>().is_some() {
            return ExitCode::from(5);
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BidsError) -> u8 {
    match error {
        BidsError::MissingSettings
        | BidsError::ConfigRead(_)
        | BidsError::ConfigParse(_)
        | BidsError::MissingJobFields(_) => 2,
        BidsError::ManifestNotFound(_)
        | BidsError::ManifestUnreadable { .. }
        | BidsError::NoValidSets { .. }
        | BidsError::UnsupportedFormat(_) => 3,
        BidsError::AmbiguousModality { .. }
        | BidsError::UnknownModality(_)
        | BidsError::TaskRequiredButMissing(_) => 4,
        BidsError::MissingTool(_)
        | BidsError::ExternalToolFailure { .. }
        | BidsError::UnresolvedOutput(_) => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_job(args),
        Commands::Manifest(args) => {
            let manifest = Manifest::refresh(&args.dir, args.recursive)?;
            JsonOutput::print_manifest(&ManifestReport {
                dir: args.dir,
                manifest,
            })
            .into_diagnostic()
        }
        Commands::Validate(args) => {
            let sets = validator::validate(args.format, &args.invalid_dir, &args.valid_dir)?;
            JsonOutput::print_validate(&ValidateReport {
                format: args.format,
                sets,
            })
            .into_diagnostic()
        }
        Commands::Detect(args) => {
            let manifest = Manifest::load(&args.dir)?;
            let format = detect_format(&manifest, &args.dir)?;
            JsonOutput::print_detect(&DetectReport {
                dir: args.dir,
                format,
            })
            .into_diagnostic()
        }
    }
}

fn run_job(args: RunArgs) -> miette::Result<()> {
    let result = execute_job(&args);
    if let (Err(report), Some(error_dir)) = (&result, &args.error_dir) {
        if args.job.exists() {
            quarantine_job(&args.job, error_dir, &report.to_string())?;
        }
    }
    result
}

fn execute_job(args: &RunArgs) -> miette::Result<()> {
    let settings = SettingsLoader::resolve(args.settings.as_deref())?;
    let job = JobLoader::load(&args.job)?;

    let converter = SystemConverter::new(&settings.converter);
    match converter.tool_status() {
        ToolStatus::Ready => {
            if let Some(version) = converter.tool_info() {
                tracing::debug!(converter = %version, "converter found");
            }
        }
        ToolStatus::Missing { message } => tracing::warn!("{message}"),
    }

    let app = App::new(settings, converter);
    let sink: &dyn ProgressSink = if args.quiet { &JsonOutput } else { &LogSink };
    let report = app.run_job(&job, args.input.as_deref(), sink)?;
    JsonOutput::print_job(&report).into_diagnostic()?;
    if !report.is_success() {
        return Err(PartialFailure {
            failed: report.failures.len(),
            total: report.failures.len() + report.sets.len(),
        }
        .into());
    }
    Ok(())
}
