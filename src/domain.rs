use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BidsError;

/// Label used when no rule or filename convention yields a modality.
pub const UNKNOWN_MODALITY: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Dicom,
    Parrec,
    Nifti,
}

impl SourceFormat {
    /// Directory name used under `sourcedata/.../ses-XX/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            SourceFormat::Dicom => "DICOM",
            SourceFormat::Parrec => "PARREC",
            SourceFormat::Nifti => "NIFTI",
        }
    }

    /// Token used in modality rule-table file names.
    pub fn rule_tag(self) -> &'static str {
        match self {
            SourceFormat::Dicom => "dicom",
            SourceFormat::Parrec => "parrec",
            SourceFormat::Nifti => "nifti",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())?;
        match ext.as_str() {
            "dcm" | "dicom" | "ima" => Some(SourceFormat::Dicom),
            "par" | "rec" => Some(SourceFormat::Parrec),
            "nii" | "gz" | "nifti" => Some(SourceFormat::Nifti),
            _ => None,
        }
    }

    /// Whether conversion goes through the external tool rather than a copy.
    pub fn needs_converter(self) -> bool {
        !matches!(self, SourceFormat::Nifti)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

impl FromStr for SourceFormat {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DICOM" => Ok(SourceFormat::Dicom),
            "PARREC" | "PAR/REC" => Ok(SourceFormat::Parrec),
            "NIFTI" => Ok(SourceFormat::Nifti),
            _ => Err(BidsError::UnsupportedFormat(value.to_string())),
        }
    }
}

/// Deterministic identifier of a validation set.
///
/// Derived from the set's identity strings (UID pair, file-name pair, or stem
/// plus file names). The strings are sorted before hashing, so the same
/// physical content always yields the same id regardless of discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetId(String);

impl SetId {
    pub fn derive<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = parts
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>();
        parts.sort();
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("set-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SetId {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(BidsError::EmptySetId);
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Two-digit zero fill used for session labels and run numbers.
///
/// Numeric input is formatted with `{:02}` (wider values keep their width);
/// anything else is left-padded with `0` to two characters.
pub fn zero_fill(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<u64>() {
        Ok(number) => format!("{number:02}"),
        Err(_) => format!("{trimmed:0>2}"),
    }
}
