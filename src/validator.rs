use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{SetId, SourceFormat};
use crate::error::BidsError;
use crate::formats::{dicom, nifti, parrec};
use crate::fs_util::{self, fs_err, split_nifti_name};
use crate::manifest::{Manifest, ManifestEntry};

/// Subdirectory of a NIfTI set holding its `.json`/`.bval`/`.bvec` files.
pub const SIDECAR_DIR: &str = "sidecars";
pub const SIDECAR_EXTENSIONS: [&str; 3] = ["json", "bval", "bvec"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedSet {
    pub dir: PathBuf,
    pub set_id: SetId,
    pub format: SourceFormat,
}

/// Groups the manifested files of `invalid_dir` into acquisition sets and
/// moves every accepted set into `valid_dir/{set_id}`.
///
/// Sets failing their structural check are dropped; only an empty result is
/// an error.
pub fn validate(
    format: SourceFormat,
    invalid_dir: &Path,
    valid_dir: &Path,
) -> Result<Vec<ValidatedSet>, BidsError> {
    let manifest = Manifest::load(invalid_dir)?;
    info!(
        format = %format,
        dir = %invalid_dir.display(),
        files = manifest.len(),
        "validating source files"
    );
    let sets = match format {
        SourceFormat::Dicom => validate_dicom(&manifest, valid_dir)?,
        SourceFormat::Parrec => validate_parrec(&manifest, valid_dir)?,
        SourceFormat::Nifti => validate_nifti(&manifest, valid_dir)?,
    };
    if sets.is_empty() {
        return Err(BidsError::NoValidSets {
            format: format.to_string(),
            dir: invalid_dir.to_path_buf(),
        });
    }
    info!(format = %format, sets = sets.len(), "validation finished");
    Ok(sets)
}

fn validate_dicom(manifest: &Manifest, valid_dir: &Path) -> Result<Vec<ValidatedSet>, BidsError> {
    let mut groups = IndexMap::<dicom::SeriesIdentity, Vec<&ManifestEntry>>::new();
    for entry in manifest.sorted_by_index() {
        match dicom::read_identity(&entry.path()) {
            Ok(identity) => groups.entry(identity).or_default().push(entry),
            Err(err) => debug!(file = %entry.file_path, error = %err, "skipping unreadable DICOM file"),
        }
    }

    let mut sets = Vec::new();
    for (identity, entries) in groups {
        let set_id = SetId::derive([&identity.study_uid, &identity.series_uid]);
        let set_dir = valid_dir.join(set_id.as_str());
        let mut moved = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = relocate(entry, &set_dir)?;
            moved.push(ManifestEntry {
                index: entry.index,
                file_path: target.to_string_lossy().into_owned(),
            });
        }
        info!(set = %set_id, series = %identity.series_uid, files = moved.len(), "DICOM set accepted");
        Manifest { path: moved }.write(&set_dir)?;
        sets.push(ValidatedSet {
            dir: set_dir,
            set_id,
            format: SourceFormat::Dicom,
        });
    }
    Ok(sets)
}

#[derive(Default)]
struct ParRecPair<'a> {
    par: Option<&'a ManifestEntry>,
    rec: Option<&'a ManifestEntry>,
}

fn validate_parrec(manifest: &Manifest, valid_dir: &Path) -> Result<Vec<ValidatedSet>, BidsError> {
    let mut pairs = IndexMap::<String, ParRecPair>::new();
    for entry in manifest.sorted_by_index() {
        let path = entry.path();
        let stem = path
            .file_stem()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|value| value.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "par" => pairs.entry(stem).or_default().par = Some(entry),
            "rec" => pairs.entry(stem).or_default().rec = Some(entry),
            _ => debug!(file = %entry.file_path, "skipping non PAR/REC file"),
        }
    }

    let mut sets = Vec::new();
    for (stem, pair) in pairs {
        let (Some(par), Some(rec)) = (pair.par, pair.rec) else {
            warn!(stem = %stem, "incomplete PAR/REC pair dropped");
            continue;
        };
        let report = match parrec::check_pair(&par.path(), &rec.path()) {
            Ok(report) => report,
            Err(err) => {
                warn!(stem = %stem, error = %err, "unreadable PAR/REC pair dropped");
                continue;
            }
        };
        for warning in &report.warnings {
            warn!(stem = %stem, "{warning}");
        }
        if !report.is_valid() {
            let err = BidsError::StructuralValidationFailed {
                set: stem.clone(),
                reasons: report.errors,
            };
            warn!(error = %err, "PAR/REC set dropped");
            continue;
        }

        let set_id = SetId::derive([par.file_name(), rec.file_name()]);
        let set_dir = valid_dir.join(set_id.as_str());
        relocate(par, &set_dir)?;
        relocate(rec, &set_dir)?;
        Manifest::refresh(&set_dir, false)?;
        info!(set = %set_id, stem = %stem, "PAR/REC set accepted");
        sets.push(ValidatedSet {
            dir: set_dir,
            set_id,
            format: SourceFormat::Parrec,
        });
    }
    Ok(sets)
}

#[derive(Default)]
struct NiftiGroup<'a> {
    images: Vec<&'a ManifestEntry>,
    sidecars: Vec<&'a ManifestEntry>,
}

fn validate_nifti(manifest: &Manifest, valid_dir: &Path) -> Result<Vec<ValidatedSet>, BidsError> {
    let mut groups = IndexMap::<String, NiftiGroup>::new();
    for entry in manifest.sorted_by_index() {
        let name = entry.file_name();
        let (stem, ext) = split_nifti_name(&name);
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        if fs_util::is_nifti_name(&name) {
            groups.entry(stem.to_string()).or_default().images.push(entry);
        } else if SIDECAR_EXTENSIONS.contains(&ext.as_str()) {
            groups.entry(stem.to_string()).or_default().sidecars.push(entry);
        } else {
            debug!(file = %entry.file_path, "skipping non NIfTI file");
        }
    }

    let mut sets = Vec::new();
    for (stem, group) in groups {
        let image = match group.images.as_slice() {
            [image] => *image,
            [] => {
                warn!(stem = %stem, "sidecars without an image dropped");
                continue;
            }
            _ => {
                warn!(stem = %stem, images = group.images.len(), "several images share one stem, group dropped");
                continue;
            }
        };
        let report = match nifti::check_image(&image.path()) {
            Ok(report) => report,
            Err(err) => {
                warn!(file = %image.file_path, error = %err, "unreadable NIfTI image dropped");
                continue;
            }
        };
        for warning in &report.warnings {
            warn!(stem = %stem, "{warning}");
        }
        if !report.is_valid() {
            let err = BidsError::StructuralValidationFailed {
                set: stem.clone(),
                reasons: report.errors,
            };
            warn!(error = %err, "NIfTI set dropped");
            continue;
        }

        let mut identity = vec![stem.clone(), image.file_name()];
        identity.extend(group.sidecars.iter().map(|entry| entry.file_name()));
        let set_id = SetId::derive(&identity);
        let set_dir = valid_dir.join(set_id.as_str());
        relocate(image, &set_dir)?;
        for sidecar in &group.sidecars {
            relocate(sidecar, &set_dir.join(SIDECAR_DIR))?;
        }
        Manifest::refresh(&set_dir, false)?;
        info!(set = %set_id, stem = %stem, sidecars = group.sidecars.len(), "NIfTI set accepted");
        sets.push(ValidatedSet {
            dir: set_dir,
            set_id,
            format: SourceFormat::Nifti,
        });
    }
    Ok(sets)
}

/// Moves one manifested file into `dir`, prefixing the manifest index when
/// the name is already taken.
fn relocate(entry: &ManifestEntry, dir: &Path) -> Result<PathBuf, BidsError> {
    fs::create_dir_all(dir).map_err(|err| fs_err("create dir", dir, err))?;
    let name = entry.file_name();
    let mut target = dir.join(&name);
    if target.exists() {
        target = dir.join(format!("{:04}_{name}", entry.index));
    }
    fs_util::move_file(&entry.path(), &target)?;
    Ok(target)
}
