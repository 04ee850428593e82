//! Header readers and structural checks for the supported source formats.

pub mod dicom;
pub mod nifti;
pub mod parrec;

use std::collections::BTreeMap;

use serde::Serialize;

/// Normalized header key → stringified value.
pub type HeaderMap = BTreeMap<String, String>;

/// Strips whitespace and every character outside `[A-Za-z0-9_-]`, then
/// lowercases. Applied to header keys and to rule-table keys alike.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// Outcome of a structural check. Errors make the candidate set invalid;
/// warnings are logged only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckReport {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
