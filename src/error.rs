use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidsError {
    #[error("missing settings file bids-rawdata.json (current directory or user config dir)")]
    MissingSettings,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("job config is missing required fields: {}", .0.join(", "))]
    MissingJobFields(Vec<String>),

    #[error("manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("manifest unreadable at {path}: {message}")]
    ManifestUnreadable { path: PathBuf, message: String },

    #[error("no valid {format} sets found in {dir}")]
    NoValidSets { format: String, dir: PathBuf },

    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read header of {path}: {message}")]
    HeaderRead { path: PathBuf, message: String },

    #[error("structural validation failed for {set}: {}", .reasons.join("; "))]
    StructuralValidationFailed { set: String, reasons: Vec<String> },

    #[error("set id must not be empty")]
    EmptySetId,

    #[error("NIfTI integrity error: {0}")]
    NiftiIntegrity(String),

    #[error("multiple modalities found in {set}: {}", .modalities.join(", "))]
    AmbiguousModality { set: String, modalities: Vec<String> },

    #[error("unknown modality: {0}")]
    UnknownModality(String),

    #[error("task entity required for {0} but the job has no task option")]
    TaskRequiredButMissing(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {message}")]
    ExternalToolFailure { tool: String, message: String },

    #[error("no converter output matched {0}")]
    UnresolvedOutput(String),

    #[error("timed out waiting for run lock {0}")]
    LockTimeout(PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
