use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::domain::{SetId, SourceFormat};
use crate::error::BidsError;
use crate::fs_util::{file_name, split_nifti_name};
use crate::manifest::{Manifest, ManifestEntry};
use crate::validator::SIDECAR_DIR;

/// Suffix used for a NIfTI stem without any `_` token.
const NIFTI_FALLBACK_SUFFIX: &str = "NIFTI";

/// Renames the files of one validated set to `item_{set_id}_…` in place and
/// rewrites the set manifest with the new paths.
pub fn separate(format: SourceFormat, dir: &Path, set_id: &str) -> Result<Manifest, BidsError> {
    let set_id = set_id.parse::<SetId>()?;
    let manifest = Manifest::load(dir)?;
    if manifest.is_empty() {
        return Err(BidsError::ManifestUnreadable {
            path: Manifest::file_path(dir),
            message: "manifest has no entries".to_string(),
        });
    }
    if format == SourceFormat::Nifti {
        check_single_image(&manifest)?;
    }

    let mut renamed = Vec::with_capacity(manifest.len());
    for entry in manifest.sorted_by_index() {
        let source = entry.path();
        let name = entry.file_name();
        let Some(target_name) = target_name(format, &set_id, entry.index, &name) else {
            warn!(file = %name, "no canonical name for file, left in place");
            renamed.push(entry.clone());
            continue;
        };
        let target = dir.join(&target_name);
        let path = if rename(&source, &target) { target.clone() } else { source };
        if format == SourceFormat::Nifti && path == target {
            rename_sidecars(dir, split_nifti_name(&name).0, split_nifti_name(&target_name).0);
        }
        renamed.push(ManifestEntry {
            index: entry.index,
            file_path: path.to_string_lossy().into_owned(),
        });
    }

    let manifest = Manifest { path: renamed };
    manifest.write(dir)?;
    info!(set = %set_id, format = %format, files = manifest.len(), "set separated");
    Ok(manifest)
}

fn check_single_image(manifest: &Manifest) -> Result<(), BidsError> {
    if manifest.len() > 1 {
        return Err(BidsError::NiftiIntegrity(format!(
            "expected one image per set, found {}",
            manifest.len()
        )));
    }
    if let Some(entry) = manifest.path.iter().find(|entry| entry.index >= 2) {
        return Err(BidsError::NiftiIntegrity(format!(
            "image {} has index {}, expected 1",
            entry.file_path, entry.index
        )));
    }
    Ok(())
}

/// Canonical file name for one manifested file; `None` for files the format
/// does not name (a stray file in a PAR/REC set).
pub fn target_name(format: SourceFormat, set_id: &SetId, index: u32, name: &str) -> Option<String> {
    match format {
        SourceFormat::Dicom => {
            let ext = Path::new(name)
                .extension()
                .map(|value| format!(".{}", value.to_string_lossy()))
                .unwrap_or_default();
            Some(format!("item_{set_id}_{index:04}{ext}"))
        }
        SourceFormat::Parrec => {
            let ext = Path::new(name)
                .extension()
                .map(|value| value.to_string_lossy().to_ascii_lowercase())?;
            match ext.as_str() {
                "par" => Some(format!("item_{set_id}_0001.par")),
                "rec" => Some(format!("item_{set_id}_0002.rec")),
                _ => None,
            }
        }
        SourceFormat::Nifti => {
            let (stem, ext) = split_nifti_name(name);
            let suffix = match stem.rsplit_once('_') {
                Some((_, last)) if !last.is_empty() => last,
                _ => NIFTI_FALLBACK_SUFFIX,
            };
            Some(format!("item_{set_id}_{suffix}_0001{ext}"))
        }
    }
}

fn rename(source: &Path, target: &Path) -> bool {
    if !source.exists() {
        warn!(file = %source.display(), "source file missing, skipped");
        return false;
    }
    if source == target {
        return true;
    }
    if target.exists() {
        warn!(file = %target.display(), "rename target already exists, skipped");
        return false;
    }
    match fs::rename(source, target) {
        Ok(()) => true,
        Err(err) => {
            warn!(file = %source.display(), error = %err, "rename failed, skipped");
            false
        }
    }
}

fn rename_sidecars(dir: &Path, old_stem: &str, new_stem: &str) {
    let sidecar_dir = dir.join(SIDECAR_DIR);
    let Ok(entries) = fs::read_dir(&sidecar_dir) else {
        return;
    };
    let sidecars = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect::<Vec<PathBuf>>();
    for path in sidecars {
        let name = file_name(&path);
        let Some(ext) = name.strip_prefix(old_stem).filter(|rest| rest.starts_with('.')) else {
            continue;
        };
        rename(&path, &sidecar_dir.join(format!("{new_stem}{ext}")));
    }
}
