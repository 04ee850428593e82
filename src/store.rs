use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::config::{ResolvedJob, Settings};
use crate::domain::SourceFormat;
use crate::error::BidsError;
use crate::fs_util;
use crate::manifest::Manifest;
use crate::validator::SIDECAR_EXTENSIONS;

/// Layout of one project dataset under the working directory.
///
/// `{working_dir}/{systemId}/{projectCode}/{projectSeq}/{orgId}/{category}/{bodyPart}/{domain}`
/// holds a `sourcedata` tree (raw drops, split into `invalid_data` and
/// `valid_data` per format) and a `rawdata` tree (converted output).
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
    subject: String,
    session: String,
}

impl Store {
    pub fn for_job(settings: &Settings, job: &ResolvedJob) -> Self {
        let root = settings
            .working_dir
            .join(&job.system_id)
            .join(&job.project_code)
            .join(&job.project_seq)
            .join(&job.org_id)
            .join(&job.category)
            .join(&job.body_part)
            .join(&job.domain);
        Self::new_with_root(root, job.alias(), job.session())
    }

    pub fn new_with_root(root: Utf8PathBuf, subject: String, session: String) -> Self {
        Self {
            root,
            subject,
            session,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sourcedata_session_dir(&self) -> Utf8PathBuf {
        self.root
            .join("sourcedata")
            .join(format!("sub-{}", self.subject))
            .join(format!("ses-{}", self.session))
    }

    pub fn invalid_dir(&self, format: SourceFormat) -> Utf8PathBuf {
        self.sourcedata_session_dir()
            .join(format.dir_name())
            .join("invalid_data")
    }

    pub fn valid_dir(&self, format: SourceFormat) -> Utf8PathBuf {
        self.sourcedata_session_dir()
            .join(format.dir_name())
            .join("valid_data")
    }

    /// Root handed to the name builder; subject and session directories are
    /// appended below it.
    pub fn rawdata_root(&self) -> Utf8PathBuf {
        self.root.join("rawdata")
    }

    /// Staging directory for drops whose format is not known yet.
    pub fn staging_dir(&self) -> Utf8PathBuf {
        self.sourcedata_session_dir().join("incoming")
    }

    /// Copies the drop into a staging directory, manifests it, detects its
    /// format, then moves it to the format's `invalid_data` directory.
    pub fn ingest(&self, input: &Path) -> Result<(SourceFormat, Utf8PathBuf), BidsError> {
        if !input.is_dir() {
            return Err(BidsError::Filesystem(format!(
                "input directory not found: {}",
                input.display()
            )));
        }
        let staging = self.staging_dir();
        if staging.as_std_path().exists() {
            fs::remove_dir_all(staging.as_std_path())
                .map_err(|err| fs_util::fs_err("remove", staging.as_std_path(), err))?;
        }
        let copied = fs_util::copy_dir_contents(input, staging.as_std_path())?;
        let manifest = Manifest::scan(staging.as_std_path(), true)?;
        let format = detect_format(&manifest, input)?;

        let invalid = self.invalid_dir(format);
        if let Some(parent) = invalid.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| fs_util::fs_err("create dir", parent.as_std_path(), err))?;
        }
        if invalid.as_std_path().exists() {
            fs::remove_dir_all(invalid.as_std_path())
                .map_err(|err| fs_util::fs_err("remove", invalid.as_std_path(), err))?;
        }
        fs::rename(staging.as_std_path(), invalid.as_std_path())
            .map_err(|err| fs_util::fs_err("rename", staging.as_std_path(), err))?;
        Manifest::refresh(invalid.as_std_path(), true)?;
        info!(input = %input.display(), files = copied, format = %format, dir = %invalid, "input ingested");
        Ok((format, invalid))
    }
}

/// Source format of a manifested directory, from the extension of the
/// lowest-index entry that is not a NIfTI sidecar.
pub fn detect_format(manifest: &Manifest, dir: &Path) -> Result<SourceFormat, BidsError> {
    let first = manifest
        .sorted_by_index()
        .into_iter()
        .find(|entry| !is_sidecar(&entry.path()))
        .ok_or_else(|| BidsError::NoValidSets {
            format: "any".to_string(),
            dir: dir.to_path_buf(),
        })?;
    SourceFormat::from_path(&first.path())
        .ok_or_else(|| BidsError::UnsupportedFormat(first.file_name()))
}

fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SIDECAR_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Upload location of a job when no explicit input is given.
pub fn upload_input(settings: &Settings, job: &ResolvedJob) -> Option<Utf8PathBuf> {
    settings
        .upload_dir
        .as_ref()
        .map(|dir| dir.join(&job.user).join(&job.upload_time))
}
