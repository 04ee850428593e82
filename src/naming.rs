use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ResolvedJob, TaskOption};
use crate::domain::SourceFormat;
use crate::error::BidsError;
use crate::formats::{HeaderMap, dicom, parrec};
use crate::fs_util::{file_name, is_nifti_name, split_nifti_name};
use crate::manifest::Manifest;
use crate::modality::ModalityMap;
use crate::validator::SIDECAR_DIR;

/// Placeholder the converter expands to a per-series acquisition label.
pub const ACQ_WILDCARD: &str = "acq-%u";

/// Optional entities that apply to one (data type, modality) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityFlags {
    pub task: bool,
    pub acq: bool,
    pub dir: bool,
}

impl EntityFlags {
    fn from_object(flags: &IndexMap<String, Value>) -> Self {
        let on = |name: &str| {
            flags
                .get(name)
                .is_some_and(|value| !matches!(value, Value::Null | Value::Bool(false)))
        };
        Self {
            task: on("task"),
            acq: on("acq"),
            dir: on("dir"),
        }
    }
}

/// Entity rules keyed by data type, then modality, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct EntityRules {
    data_types: IndexMap<String, IndexMap<String, EntityFlags>>,
}

impl EntityRules {
    pub fn load(path: &Path) -> Result<Self, BidsError> {
        let content =
            fs::read_to_string(path).map_err(|_| BidsError::ConfigRead(path.to_path_buf()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, BidsError> {
        let raw: IndexMap<String, IndexMap<String, IndexMap<String, Value>>> =
            serde_json::from_str(content).map_err(|err| BidsError::ConfigParse(err.to_string()))?;
        let data_types = raw
            .into_iter()
            .map(|(data_type, modalities)| {
                let modalities = modalities
                    .into_iter()
                    .map(|(modality, flags)| (modality, EntityFlags::from_object(&flags)))
                    .collect();
                (data_type, modalities)
            })
            .collect();
        Ok(Self { data_types })
    }

    /// Data type declaring `modality` first, with its entity flags.
    pub fn lookup(&self, modality: &str) -> Option<(&str, EntityFlags)> {
        self.data_types.iter().find_map(|(data_type, modalities)| {
            modalities
                .get(modality)
                .map(|flags| (data_type.as_str(), *flags))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub subject: String,
    pub session: String,
    pub data_type: String,
    pub modality: String,
}

/// Allocates run numbers per (subject, session, data type, modality).
///
/// A key is seeded from the destination directory on first use; later
/// allocations for it only advance the in-memory counter.
#[derive(Debug, Default)]
pub struct RunCounter {
    last: HashMap<RunKey, u32>,
}

impl RunCounter {
    pub fn next(&mut self, key: RunKey, dest_dir: &Path) -> u32 {
        let last = self
            .last
            .entry(key)
            .or_insert_with_key(|key| highest_run(dest_dir, &key.modality));
        *last += 1;
        *last
    }
}

/// Highest `run-NN` among `*_{modality}.nii.gz` in `dir`; 0 when none.
pub fn highest_run(dir: &Path, modality: &str) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let suffix = format!("_{modality}.nii.gz");
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(&suffix))
        .filter_map(|name| {
            name.split('_')
                .find_map(|part| part.strip_prefix("run-"))
                .and_then(|number| number.parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidsPath {
    pub data_type: String,
    pub modality: String,
    pub run: u32,
    pub path: PathBuf,
}

impl BidsPath {
    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }
}

pub struct NameBuilder {
    rules: EntityRules,
    rawdata_root: PathBuf,
    subject: String,
    session: String,
    task: TaskOption,
    format: SourceFormat,
    counter: RunCounter,
}

impl NameBuilder {
    pub fn new(
        rules: EntityRules,
        rawdata_root: PathBuf,
        job: &ResolvedJob,
        format: SourceFormat,
    ) -> Self {
        Self {
            rules,
            rawdata_root,
            subject: job.alias(),
            session: job.session(),
            task: job.task.clone(),
            format,
            counter: RunCounter::default(),
        }
    }

    pub fn session_dir(&self) -> PathBuf {
        self.rawdata_root
            .join(format!("sub-{}", self.subject))
            .join(format!("ses-{}", self.session))
    }

    pub fn build_all(&mut self, mapping: &ModalityMap) -> Result<IndexMap<PathBuf, BidsPath>, BidsError> {
        let mut paths = IndexMap::new();
        for (set, modality) in mapping {
            let path = self.build_one(set, modality)?;
            paths.insert(set.clone(), path);
        }
        Ok(paths)
    }

    /// Fails when `modality` cannot be named for this job, without
    /// allocating a run.
    pub fn check(&self, modality: &str) -> Result<(), BidsError> {
        self.resolve(modality).map(|_| ())
    }

    fn resolve(&self, modality: &str) -> Result<(String, EntityFlags), BidsError> {
        let (data_type, flags) = self
            .rules
            .lookup(modality)
            .ok_or_else(|| BidsError::UnknownModality(modality.to_string()))?;
        if flags.task && (!self.task.is_func || self.task.option.is_empty()) {
            return Err(BidsError::TaskRequiredButMissing(modality.to_string()));
        }
        Ok((data_type.to_string(), flags))
    }

    pub fn build_one(&mut self, set_dir: &Path, modality: &str) -> Result<BidsPath, BidsError> {
        let (data_type, flags) = self.resolve(modality)?;

        let mut entities = vec![
            format!("sub-{}", self.subject),
            format!("ses-{}", self.session),
        ];
        if flags.task {
            entities.push(format!("task-{}", self.task.option));
        }
        if flags.acq {
            entities.push(ACQ_WILDCARD.to_string());
        }
        if flags.dir {
            match phase_direction(self.format, set_dir) {
                Some(dir) => entities.push(format!("dir-{dir}")),
                None => debug!(set = %set_dir.display(), "no phase-encoding direction, dir omitted"),
            }
        }

        let dest_dir = self.session_dir().join(&data_type);
        let key = RunKey {
            subject: self.subject.clone(),
            session: self.session.clone(),
            data_type: data_type.clone(),
            modality: modality.to_string(),
        };
        let run = self.counter.next(key, &dest_dir);
        entities.push(format!("run-{run:02}"));
        entities.push(modality.to_string());

        let path = dest_dir.join(format!("{}.nii.gz", entities.join("_")));
        info!(set = %set_dir.display(), target = %path.display(), "destination named");
        Ok(BidsPath {
            data_type,
            modality: modality.to_string(),
            run,
            path,
        })
    }
}

/// Phase-encoding direction of the set's first readable item of `format`,
/// reduced to alphanumerics.
pub fn phase_direction(format: SourceFormat, set_dir: &Path) -> Option<String> {
    let manifest = Manifest::load(set_dir).ok()?;
    let entries = manifest
        .sorted_by_index()
        .into_iter()
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    let raw = match format {
        SourceFormat::Dicom => entries
            .iter()
            .find_map(|path| dicom::read_metadata(path).ok())
            .and_then(|metadata| {
                lookup_any(&metadata, &["phaseencodingdirection", "inplanephaseencodingdirection"])
            }),
        SourceFormat::Parrec => {
            let par = entries.iter().find(|path| has_extension(path, "par"))?;
            let metadata = parrec::read_metadata(par).ok()?;
            lookup_any(&metadata, &["preparationdirection"]).map(|value| initials(&value))
        }
        SourceFormat::Nifti => {
            let image = entries.iter().find(|path| is_nifti_name(&file_name(path)))?;
            sidecar_direction(set_dir, &file_name(image))
        }
    }?;
    let cleaned = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(ext))
}

fn lookup_any(metadata: &HeaderMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| metadata.get(*key).cloned())
}

/// `Anterior-Posterior` → `AP`.
fn initials(value: &str) -> String {
    value
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter_map(|word| word.chars().next())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

fn sidecar_direction(set_dir: &Path, image_name: &str) -> Option<String> {
    let (stem, _) = split_nifti_name(image_name);
    let path = set_dir.join(SIDECAR_DIR).join(format!("{stem}.json"));
    let content = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&content).ok()?;
    value
        .get("PhaseEncodingDirection")
        .and_then(Value::as_str)
        .map(str::to_string)
}
