use std::path::Path;

use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom_dictionary_std::{StandardDataDictionary, tags};
use dicom_object::{DefaultDicomObject, OpenFileOptions, Tag};

use crate::error::BidsError;
use crate::formats::{HeaderMap, normalize_key};

/// The (StudyInstanceUID, SeriesInstanceUID) pair that groups DICOM files
/// into one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesIdentity {
    pub study_uid: String,
    pub series_uid: String,
}

fn open_header(path: &Path) -> Result<DefaultDicomObject, BidsError> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|err| BidsError::HeaderRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn string_tag(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|elem| elem.to_str().ok())
        .map(|value| clean_value(&value))
        .filter(|value| !value.is_empty())
}

fn clean_value(value: &str) -> String {
    value.trim_matches(|ch: char| ch.is_whitespace() || ch == '\0').to_string()
}

/// Reads the grouping identity; a file without both UIDs is rejected.
pub fn read_identity(path: &Path) -> Result<SeriesIdentity, BidsError> {
    let obj = open_header(path)?;
    let study_uid = string_tag(&obj, tags::STUDY_INSTANCE_UID);
    let series_uid = string_tag(&obj, tags::SERIES_INSTANCE_UID);
    match (study_uid, series_uid) {
        (Some(study_uid), Some(series_uid)) => Ok(SeriesIdentity {
            study_uid,
            series_uid,
        }),
        _ => Err(BidsError::HeaderRead {
            path: path.to_path_buf(),
            message: "missing StudyInstanceUID or SeriesInstanceUID".to_string(),
        }),
    }
}

/// Every dataset element that has a standard keyword and a non-empty textual
/// value, keyed by the normalized keyword.
pub fn read_metadata(path: &Path) -> Result<HeaderMap, BidsError> {
    let obj = open_header(path)?;
    let mut metadata = HeaderMap::new();
    for elem in obj.iter() {
        let tag = elem.header().tag;
        let Some(entry) = StandardDataDictionary.by_tag(tag) else {
            continue;
        };
        let Ok(value) = elem.to_str() else {
            continue;
        };
        let value = clean_value(&value);
        if value.is_empty() {
            continue;
        }
        metadata.insert(normalize_key(entry.alias()), value);
    }
    Ok(metadata)
}
