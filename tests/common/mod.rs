#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tempfile::TempDir;

use bids_rawdata::app::{ProgressEvent, ProgressSink};
use bids_rawdata::config::{JobLoader, ResolvedJob, Settings, SettingsConfig, SettingsLoader};
use bids_rawdata::convert::{Converter, ToolOutput};
use bids_rawdata::error::BidsError;

pub const ALIAS: &str = "2PRJ3ORG007";
pub const RULE_STEM: &str = "SYS_PRJ_3_ORG";

pub const SUFFIX_MAP: &str = r#"{
    "anat": { "T1w": { "task": null, "acq": false, "dir": false } },
    "func": { "bold": { "task": true } },
    "dwi":  { "dwi": { "acq": true, "dir": true } }
}"#;

/// Working directory with settings, rule tables and entity rules in place.
pub struct Workspace {
    pub temp: TempDir,
    pub settings: Settings,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join("modality").join("dicom")).unwrap();
        fs::create_dir_all(work.join("modality").join("parrec")).unwrap();
        fs::write(work.join("suffix_map.json"), SUFFIX_MAP).unwrap();
        fs::write(
            work.join("modality")
                .join("dicom")
                .join(format!("{RULE_STEM}_dicom_modality.json")),
            json!({
                "T1w": [{ "SeriesDescription": ["T1 MPRAGE", "t1_mprage"] }],
                "bold": [{ "SeriesDescription": "fMRI rest" }]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            work.join("modality")
                .join("parrec")
                .join(format!("{RULE_STEM}_parrec_modality.json")),
            json!({ "dwi": [{ "Protocol name": ["DTI_32"] }] }).to_string(),
        )
        .unwrap();

        let config: SettingsConfig = serde_json::from_value(json!({
            "working_dir": work.to_string_lossy(),
            "lock_timeout_secs": 5
        }))
        .unwrap();
        let settings = SettingsLoader::resolve_config(config);
        Self { temp, settings }
    }

    pub fn input(&self, name: &str) -> PathBuf {
        let dir = self.temp.path().join("drops").join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn dataset_root(&self) -> PathBuf {
        self.temp
            .path()
            .join("work/SYS/PRJ/3/ORG/IMAGE/BRAIN/DATA")
    }

    pub fn rawdata_dir(&self, data_type: &str) -> PathBuf {
        self.dataset_root()
            .join("rawdata")
            .join(format!("sub-{ALIAS}"))
            .join("ses-01")
            .join(data_type)
    }
}

pub fn job_value() -> Value {
    json!({
        "user": "alice",
        "systemId": "SYS",
        "projectCode": "PRJ",
        "projectSeq": 3,
        "orgId": "ORG",
        "trialIndex": "1",
        "uploadTime": "20240101120000",
        "subjectId": "007"
    })
}

pub fn job() -> ResolvedJob {
    JobLoader::resolve_value(job_value()).unwrap()
}

pub fn write_dicom(path: &Path, series: &str, description: &str) {
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.4"),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("MR")),
        DataElement::new(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            PrimitiveValue::from(description),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)),
    ]);
    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax("1.2.840.10008.1.2.1")
                .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
                .media_storage_sop_instance_uid("1.2.3.4"),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

/// PAR text with `slices` single-dynamic 4x4 16-bit images, and the REC
/// size that matches it.
pub fn par_text(slices: u32, protocol: &str) -> (String, u64) {
    let mut text = String::new();
    text.push_str("# === GENERAL INFORMATION ===\n");
    text.push_str(&format!(".    Protocol name                      :   {protocol}\n"));
    text.push_str(".    Max. number of cardiac phases      :   1\n");
    text.push_str(".    Max. number of echoes              :   1\n");
    text.push_str(&format!(".    Max. number of slices/locations    :   {slices}\n"));
    text.push_str(".    Max. number of dynamics            :   1\n");
    text.push_str(".    Scan resolution  (x, y)            :   4  4\n");
    text.push_str(".    Preparation direction              :   Anterior-Posterior\n");
    text.push_str("# === IMAGE INFORMATION ===\n");
    text.push_str("#  sl ec  dyn ph ty    idx pix scan% rec size\n");
    for slice in 1..=slices {
        text.push_str(&format!(
            "  {slice}   1    1  1 0 2   {idx}  16    100  4  4\n",
            idx = slice - 1
        ));
    }
    (text, 4 * 4 * slices as u64 * 2)
}

/// Gzipped little-endian NIfTI-1 image with 16-bit voxels.
pub fn nifti1_gz(dims: &[i16]) -> Vec<u8> {
    let mut header = vec![0u8; 352];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    header[40..42].copy_from_slice(&(dims.len() as i16).to_le_bytes());
    for (i, extent) in dims.iter().enumerate() {
        let offset = 42 + i * 2;
        header[offset..offset + 2].copy_from_slice(&extent.to_le_bytes());
    }
    header[70..72].copy_from_slice(&4i16.to_le_bytes());
    header[72..74].copy_from_slice(&16i16.to_le_bytes());
    header[108..112].copy_from_slice(&352f32.to_le_bytes());
    header[344..348].copy_from_slice(b"n+1\0");
    let voxels = dims.iter().map(|d| *d as usize).product::<usize>();
    header.resize(352 + voxels * 2, 0);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&header).unwrap();
    encoder.finish().unwrap()
}

/// Writes `{name}.nii.gz` into the output directory, filling `%` placeholders
/// the way the real converter does. Fails the calls whose 1-based number is
/// listed in `fail_on`.
#[derive(Default)]
pub struct FakeConverter {
    pub calls: Mutex<Vec<(PathBuf, String)>>,
    pub fail_on: Vec<usize>,
}

impl Converter for FakeConverter {
    fn convert(
        &self,
        source_dir: &Path,
        out_dir: &Path,
        name: &str,
    ) -> Result<ToolOutput, BidsError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push((source_dir.to_path_buf(), name.to_string()));
        if self.fail_on.contains(&calls.len()) {
            return Err(BidsError::ExternalToolFailure {
                tool: "dcm2niix".to_string(),
                message: "no valid DICOM images".to_string(),
            });
        }
        let produced = name.replace("%u", "1");
        fs::write(out_dir.join(format!("{produced}.nii.gz")), b"nifti").unwrap();
        fs::write(out_dir.join(format!("{produced}.json")), b"{}").unwrap();
        Ok(ToolOutput::default())
    }

    fn tool_info(&self) -> Option<String> {
        Some("fake 1.0".to_string())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event.message);
    }
}
