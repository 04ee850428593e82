use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::app::{JobReport, ProgressEvent, ProgressSink};
use crate::domain::SourceFormat;
use crate::manifest::Manifest;
use crate::validator::ValidatedSet;

#[derive(Debug, Clone, Serialize)]
pub struct ManifestReport {
    pub dir: PathBuf,
    pub manifest: Manifest,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateReport {
    pub format: SourceFormat,
    pub sets: Vec<ValidatedSet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectReport {
    pub dir: PathBuf,
    pub format: SourceFormat,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_job(report: &JobReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_manifest(report: &ManifestReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_validate(report: &ValidateReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_detect(report: &DetectReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
