use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BidsError;
use crate::fs_util::fs_err;
use crate::lock::LOCK_FILE_NAME;

pub const MANIFEST_FILE_NAME: &str = "file_list.json";
const MANIFEST_TMP_NAME: &str = "file_list.json.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: u32,
    pub file_path: String,
}

impl ManifestEntry {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.file_path)
    }

    pub fn file_name(&self) -> String {
        crate::fs_util::file_name(&self.path())
    }
}

/// Ordered listing of the files in a directory.
///
/// Indices are 1-based and follow the scan order, which visits the entries of
/// a directory by file name with files before subdirectories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub path: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn is_reserved(name: &str) -> bool {
        name == MANIFEST_FILE_NAME || name == MANIFEST_TMP_NAME || name == LOCK_FILE_NAME
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let path = paths
            .into_iter()
            .zip(1u32..)
            .map(|(file, index)| ManifestEntry {
                index,
                file_path: file.to_string_lossy().into_owned(),
            })
            .collect();
        Self { path }
    }

    pub fn scan(dir: &Path, recursive: bool) -> Result<Self, BidsError> {
        let mut files = Vec::new();
        collect_files(dir, recursive, &mut files)?;
        Ok(Self::from_paths(files))
    }

    pub fn load(dir: &Path) -> Result<Self, BidsError> {
        let path = Self::file_path(dir);
        if !path.exists() {
            return Err(BidsError::ManifestNotFound(path));
        }
        let content = fs::read_to_string(&path).map_err(|err| BidsError::ManifestUnreadable {
            path: path.clone(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|err| BidsError::ManifestUnreadable {
            path,
            message: err.to_string(),
        })
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, BidsError> {
        fs::create_dir_all(dir).map_err(|err| fs_err("create dir", dir, err))?;
        let path = Self::file_path(dir);
        let tmp_path = dir.join(MANIFEST_TMP_NAME);
        let content =
            serde_json::to_vec_pretty(self).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        fs::write(&tmp_path, &content).map_err(|err| fs_err("write", &tmp_path, err))?;
        fs::rename(&tmp_path, &path).map_err(|err| fs_err("rename", &tmp_path, err))?;
        debug!(manifest = %path.display(), entries = self.path.len(), "manifest written");
        Ok(path)
    }

    /// Re-scans `dir` and overwrites its manifest.
    pub fn refresh(dir: &Path, recursive: bool) -> Result<Self, BidsError> {
        let manifest = Self::scan(dir, recursive)?;
        manifest.write(dir)?;
        Ok(manifest)
    }

    pub fn sorted_by_index(&self) -> Vec<&ManifestEntry> {
        let mut entries = self.path.iter().collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.index);
        entries
    }

    pub fn first(&self) -> Option<&ManifestEntry> {
        self.path.iter().find(|entry| entry.index == 1)
    }

    pub fn len(&self) -> usize {
        self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<(), BidsError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|err| fs_err("read dir", dir, err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| fs_err("read dir", dir, err))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
            continue;
        }
        let name = entry.file_name();
        if Manifest::is_reserved(&name.to_string_lossy()) {
            continue;
        }
        out.push(path);
    }
    if recursive {
        for sub in subdirs {
            collect_files(&sub, recursive, out)?;
        }
    }
    Ok(())
}
