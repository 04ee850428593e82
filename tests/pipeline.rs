mod common;

use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use bids_rawdata::app::App;
use bids_rawdata::config::JobLoader;
use bids_rawdata::domain::SourceFormat;
use bids_rawdata::error::BidsError;
use bids_rawdata::manifest::Manifest;

use common::{
    ALIAS, FakeConverter, RecordingSink, Workspace, job, job_value, nifti1_gz, par_text,
    write_dicom,
};

#[test]
fn dicom_series_becomes_one_run() {
    let workspace = Workspace::new();
    let input = workspace.input("dicom");
    for name in ["IM0001.dcm", "IM0002.dcm", "IM0003.dcm"] {
        write_dicom(&input.join(name), "1.2.3.1", "T1 MPRAGE");
    }

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let sink = RecordingSink::default();
    let report = app.run_job(&job(), Some(&input), &sink).unwrap();

    assert!(report.is_success());
    assert_eq!(report.format, SourceFormat::Dicom);
    assert_eq!(report.alias, ALIAS);
    assert_eq!(report.sets.len(), 1);

    let outcome = &report.sets[0];
    assert_eq!(outcome.modality, "T1w");
    let expected = workspace
        .rawdata_dir("anat")
        .join(format!("sub-{ALIAS}_ses-01_run-01_T1w.nii.gz"));
    assert_eq!(outcome.desired, expected);
    assert_eq!(outcome.actual, expected);
    assert!(expected.exists());

    for index in 1..=3 {
        let separated = outcome
            .source
            .join(format!("item_{}_{index:04}.dcm", outcome.set_id));
        assert!(separated.exists(), "{} missing", separated.display());
    }
    let rawdata = Manifest::load(&workspace.rawdata_dir("anat")).unwrap();
    assert_eq!(rawdata.len(), 2);

    let calls = app.converter().calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, outcome.source);
    assert_eq!(calls[0].1, format!("sub-{ALIAS}_ses-01_run-01_T1w"));

    let events = sink.events.lock().unwrap();
    assert!(events[0].starts_with("phase=Ingest"));
    assert!(events.last().unwrap().starts_with("phase=Done"));
}

#[test]
fn runs_continue_after_existing_files() {
    let workspace = Workspace::new();
    let anat = workspace.rawdata_dir("anat");
    fs::create_dir_all(&anat).unwrap();
    fs::write(anat.join(format!("sub-{ALIAS}_ses-01_run-03_T1w.nii.gz")), b"old").unwrap();

    let input = workspace.input("dicom");
    write_dicom(&input.join("a.dcm"), "1.2.3.1", "T1 MPRAGE");
    write_dicom(&input.join("b.dcm"), "1.2.3.2", "t1_mprage");

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let report = app.run_job(&job(), Some(&input), &RecordingSink::default()).unwrap();

    assert_eq!(report.sets.len(), 2);
    let names = report
        .sets
        .iter()
        .map(|outcome| outcome.actual.file_name().unwrap().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            format!("sub-{ALIAS}_ses-01_run-04_T1w.nii.gz"),
            format!("sub-{ALIAS}_ses-01_run-05_T1w.nii.gz"),
        ]
    );
    assert!(!anat.parent().unwrap().join(".run.lock").exists());
}

#[test]
fn failed_conversion_is_reported_per_set() {
    let workspace = Workspace::new();
    let input = workspace.input("dicom");
    write_dicom(&input.join("a.dcm"), "1.2.3.1", "T1 MPRAGE");
    write_dicom(&input.join("b.dcm"), "1.2.3.2", "T1 MPRAGE");

    let converter = FakeConverter {
        fail_on: vec![1],
        ..FakeConverter::default()
    };
    let app = App::new(workspace.settings.clone(), converter);
    let report = app.run_job(&job(), Some(&input), &RecordingSink::default()).unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.sets.len(), 1);
    assert!(report.failures[0].error.contains("no valid DICOM images"));

    let anat = workspace.rawdata_dir("anat");
    assert!(!anat.join(format!("sub-{ALIAS}_ses-01_run-01_T1w.nii.gz")).exists());
    assert!(anat.join(format!("sub-{ALIAS}_ses-01_run-02_T1w.nii.gz")).exists());
}

#[test]
fn unmapped_series_stops_before_conversion() {
    let workspace = Workspace::new();
    let input = workspace.input("dicom");
    write_dicom(&input.join("a.dcm"), "1.2.3.1", "T1 MPRAGE");
    write_dicom(&input.join("b.dcm"), "1.2.3.2", "localizer");

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let result = app.run_job(&job(), Some(&input), &RecordingSink::default());

    assert_matches!(result, Err(BidsError::UnknownModality(modality)) => {
        assert_eq!(modality, "unknown");
    });
    assert!(app.converter().calls.lock().unwrap().is_empty());
    assert!(!workspace.rawdata_dir("anat").exists());
}

#[test]
fn functional_series_needs_a_task() {
    let workspace = Workspace::new();
    let input = workspace.input("dicom");
    write_dicom(&input.join("a.dcm"), "1.2.3.1", "fMRI rest");

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let result = app.run_job(&job(), Some(&input), &RecordingSink::default());
    assert_matches!(result, Err(BidsError::TaskRequiredButMissing(_)));

    let mut value = job_value();
    value["task"] = json!({ "isFunc": true, "option": "rest" });
    let with_task = JobLoader::resolve_value(value).unwrap();
    let workspace = Workspace::new();
    let input = workspace.input("dicom");
    write_dicom(&input.join("a.dcm"), "1.2.3.1", "fMRI rest");
    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let report = app
        .run_job(&with_task, Some(&input), &RecordingSink::default())
        .unwrap();
    assert_eq!(
        report.sets[0].actual,
        workspace
            .rawdata_dir("func")
            .join(format!("sub-{ALIAS}_ses-01_task-rest_run-01_bold.nii.gz"))
    );
}

#[test]
fn parrec_pair_gets_acq_and_direction() {
    let workspace = Workspace::new();
    let input = workspace.input("parrec");
    let (text, rec_size) = par_text(3, "DTI_32");
    fs::write(input.join("scan.PAR"), text).unwrap();
    fs::write(input.join("scan.REC"), vec![0u8; rec_size as usize]).unwrap();

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let report = app.run_job(&job(), Some(&input), &RecordingSink::default()).unwrap();

    assert_eq!(report.format, SourceFormat::Parrec);
    assert_eq!(report.sets.len(), 1);
    let outcome = &report.sets[0];
    assert_eq!(outcome.modality, "dwi");
    assert_eq!(
        outcome.desired,
        workspace
            .rawdata_dir("dwi")
            .join(format!("sub-{ALIAS}_ses-01_acq-%u_dir-AP_run-01_dwi.nii.gz"))
    );
    assert_eq!(
        outcome.actual,
        workspace
            .rawdata_dir("dwi")
            .join(format!("sub-{ALIAS}_ses-01_acq-1_dir-AP_run-01_dwi.nii.gz"))
    );
    assert!(outcome.source.join(format!("item_{}_0001.par", outcome.set_id)).exists());
    assert!(outcome.source.join(format!("item_{}_0002.rec", outcome.set_id)).exists());
}

#[test]
fn truncated_rec_leaves_no_sets() {
    let workspace = Workspace::new();
    let input = workspace.input("parrec");
    let (text, rec_size) = par_text(3, "DTI_32");
    fs::write(input.join("scan.PAR"), text).unwrap();
    fs::write(input.join("scan.REC"), vec![0u8; rec_size as usize - 10]).unwrap();

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let result = app.run_job(&job(), Some(&input), &RecordingSink::default());
    assert_matches!(result, Err(BidsError::NoValidSets { .. }));
}

#[test]
fn nifti_is_copied_with_sidecar() {
    let workspace = Workspace::new();
    let input = workspace.input("nifti");
    fs::write(input.join("scan_T1w.nii.gz"), nifti1_gz(&[4, 4, 3])).unwrap();
    fs::write(input.join("scan_T1w.json"), br#"{"RepetitionTime": 2.0}"#).unwrap();

    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let report = app.run_job(&job(), Some(&input), &RecordingSink::default()).unwrap();

    assert_eq!(report.format, SourceFormat::Nifti);
    assert_eq!(report.sets.len(), 1);
    assert_eq!(report.sets[0].modality, "T1w");
    let anat = workspace.rawdata_dir("anat");
    assert!(anat.join(format!("sub-{ALIAS}_ses-01_run-01_T1w.nii.gz")).exists());
    let sidecar = fs::read_to_string(anat.join(format!("sub-{ALIAS}_ses-01_run-01_T1w.json"))).unwrap();
    assert!(sidecar.contains("RepetitionTime"));
    assert!(app.converter().calls.lock().unwrap().is_empty());
}

#[test]
fn missing_input_is_a_filesystem_error() {
    let workspace = Workspace::new();
    let app = App::new(workspace.settings.clone(), FakeConverter::default());
    let missing = workspace.temp.path().join("nowhere");
    let result = app.run_job(&job(), Some(&missing), &RecordingSink::default());
    assert_matches!(result, Err(BidsError::Filesystem(_)));
}
