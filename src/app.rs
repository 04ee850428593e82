use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::config::{ResolvedJob, Settings};
use crate::convert::{self, Converter};
use crate::domain::SourceFormat;
use crate::error::BidsError;
use crate::fs_util::{self, fs_err};
use crate::lock::RunLock;
use crate::modality::ModalityMapper;
use crate::naming::{EntityRules, NameBuilder};
use crate::separator;
use crate::store::{self, Store};
use crate::validator;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub alias: String,
    pub session: String,
    pub format: SourceFormat,
    pub dataset_root: String,
    pub sets: Vec<SetOutcome>,
    pub failures: Vec<SetFailure>,
    pub finished_at: String,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetOutcome {
    pub set_id: String,
    pub source: PathBuf,
    pub modality: String,
    pub desired: PathBuf,
    pub actual: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetFailure {
    pub source: PathBuf,
    pub modality: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn phase(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

/// Runs jobs end to end: ingest, validate, separate, map, name, convert.
pub struct App<C: Converter> {
    settings: Settings,
    converter: C,
}

impl<C: Converter> App<C> {
    pub fn new(settings: Settings, converter: C) -> Self {
        Self {
            settings,
            converter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    /// Converts one job's drop into the rawdata tree.
    ///
    /// Errors before conversion abort the job. Conversion failures are per
    /// set and end up in [`JobReport::failures`].
    pub fn run_job(
        &self,
        job: &ResolvedJob,
        input: Option<&Path>,
        sink: &dyn ProgressSink,
    ) -> Result<JobReport, BidsError> {
        let start = Instant::now();
        let store = Store::for_job(&self.settings, job);
        let input = match input {
            Some(path) => path.to_path_buf(),
            None => store::upload_input(&self.settings, job)
                .map(|path| path.into_std_path_buf())
                .ok_or_else(|| {
                    BidsError::ConfigParse(
                        "no input directory: pass --input or set upload_dir".to_string(),
                    )
                })?,
        };

        phase(sink, format!("phase=Ingest; copying {}", input.display()));
        let (format, invalid) = store.ingest(&input)?;

        phase(sink, format!("phase=Validate; {format} files"));
        let valid = store.valid_dir(format);
        let sets = validator::validate(format, invalid.as_std_path(), valid.as_std_path())?;

        phase(sink, format!("phase=Separate; {} sets", sets.len()));
        for set in &sets {
            separator::separate(format, &set.dir, set.set_id.as_str())?;
        }

        phase(sink, "phase=Map; resolving modalities".to_string());
        let rule_dir = match format {
            SourceFormat::Parrec => self.settings.parrec_modality_dir.as_std_path(),
            _ => self.settings.dicom_modality_dir.as_std_path(),
        };
        let mapper = ModalityMapper::load(format, rule_dir, &job.rule_stem());
        let set_dirs = sets.iter().map(|set| set.dir.clone()).collect::<Vec<_>>();
        let mapping = mapper.map_sets(&set_dirs)?;

        let rules = EntityRules::load(self.settings.suffix_map.as_std_path())?;
        let mut names = NameBuilder::new(
            rules,
            store.rawdata_root().into_std_path_buf(),
            job,
            format,
        );
        for modality in mapping.values() {
            names.check(modality)?;
        }

        phase(sink, "phase=Convert; waiting for session lock".to_string());
        let _lock = RunLock::acquire(&names.session_dir(), self.settings.lock_timeout)?;
        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        for set in &sets {
            let Some(modality) = mapping.get(&set.dir) else {
                continue;
            };
            let target = names.build_one(&set.dir, modality)?;
            phase(sink, format!("phase=Convert; {} -> {}", set.set_id, target.file_name()));
            match convert::convert_set(&self.converter, format, &set.dir, &target) {
                Ok(result) => outcomes.push(SetOutcome {
                    set_id: set.set_id.to_string(),
                    source: result.source,
                    modality: modality.clone(),
                    desired: result.desired,
                    actual: result.actual,
                }),
                Err(err) => {
                    error!(set = %set.dir.display(), error = %err, "conversion failed");
                    failures.push(SetFailure {
                        source: set.dir.clone(),
                        modality: modality.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let elapsed = start.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} converted, {} failed",
                outcomes.len(),
                failures.len()
            ),
            elapsed: Some(elapsed),
        });
        info!(
            alias = %job.alias(),
            converted = outcomes.len(),
            failed = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "job finished"
        );

        Ok(JobReport {
            alias: job.alias(),
            session: job.session(),
            format,
            dataset_root: store.root().to_string(),
            sets: outcomes,
            failures,
            finished_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Moves a failed job file into `error_dir` next to a `<name>_error.log`
/// holding the failure. An existing file of the same name is kept and the
/// new one gets a timestamp suffix.
pub fn quarantine_job(job_file: &Path, error_dir: &Path, message: &str) -> Result<PathBuf, BidsError> {
    fs::create_dir_all(error_dir).map_err(|err| fs_err("create dir", error_dir, err))?;
    let now = chrono::Local::now();
    let name = fs_util::file_name(job_file);
    let mut target = error_dir.join(&name);
    if target.exists() {
        let stem = job_file
            .file_stem()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = job_file
            .extension()
            .map(|value| format!(".{}", value.to_string_lossy()))
            .unwrap_or_default();
        target = error_dir.join(format!("{stem}_{}{ext}", now.format("%Y%m%d_%H%M%S")));
    }
    fs_util::move_file(job_file, &target)?;

    let log_stem = target
        .file_stem()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default();
    let log_path = error_dir.join(format!("{log_stem}_error.log"));
    let body = format!(
        "Error time: {}\nError message: {message}\n",
        now.format("%Y-%m-%d %H:%M:%S")
    );
    fs::write(&log_path, body).map_err(|err| fs_err("write", &log_path, err))?;
    error!(job = %name, moved_to = %target.display(), "job moved to error directory");
    Ok(target)
}
