use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::SourceFormat;
use crate::error::BidsError;
use crate::fs_util::{self, fs_err, split_nifti_name};
use crate::manifest::Manifest;
use crate::naming::BidsPath;
use crate::validator::{SIDECAR_DIR, SIDECAR_EXTENSIONS};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// DICOM/PAR-REC → NIfTI conversion tool.
pub trait Converter: Send + Sync {
    /// Converts every image under `source_dir` into `out_dir`, naming the
    /// output after `name` (which may carry `%` placeholders). Output files
    /// are gzip-compressed.
    fn convert(
        &self,
        source_dir: &Path,
        out_dir: &Path,
        name: &str,
    ) -> Result<ToolOutput, BidsError>;

    fn tool_info(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub enum ToolStatus {
    Ready,
    Missing { message: String },
}

/// Runs an installed converter binary (`dcm2niix` unless configured).
#[derive(Debug, Clone)]
pub struct SystemConverter {
    name: String,
    program: Option<PathBuf>,
}

impl SystemConverter {
    pub fn new(name: &str) -> Self {
        let direct = PathBuf::from(name);
        let program = if direct.components().count() > 1 && direct.exists() {
            Some(direct)
        } else {
            find_in_path(name)
        };
        Self {
            name: name.to_string(),
            program,
        }
    }

    pub fn tool_status(&self) -> ToolStatus {
        match self.program {
            Some(_) => ToolStatus::Ready,
            None => ToolStatus::Missing {
                message: format!("missing {} (DICOM to NIfTI converter)", self.name),
            },
        }
    }

    fn require_program(&self) -> Result<&PathBuf, BidsError> {
        self.program
            .as_ref()
            .ok_or_else(|| BidsError::MissingTool(self.name.clone()))
    }

    fn run_cmd(&self, program: &Path, args: &[String]) -> Result<ToolOutput, BidsError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| BidsError::ExternalToolFailure {
                tool: self.name.clone(),
                message: err.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(ToolOutput { stdout, stderr });
        }
        let message = match (stderr.is_empty(), stdout.is_empty()) {
            (false, _) => stderr,
            (true, false) => stdout,
            (true, true) => format!("command failed: {}", program.display()),
        };
        Err(BidsError::ExternalToolFailure {
            tool: self.name.clone(),
            message,
        })
    }
}

impl Converter for SystemConverter {
    fn convert(
        &self,
        source_dir: &Path,
        out_dir: &Path,
        name: &str,
    ) -> Result<ToolOutput, BidsError> {
        let program = self.require_program()?;
        fs::create_dir_all(out_dir).map_err(|err| fs_err("create dir", out_dir, err))?;
        let args = vec![
            "-f".to_string(),
            name.to_string(),
            "-z".to_string(),
            "y".to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().into_owned(),
            source_dir.to_string_lossy().into_owned(),
        ];
        self.run_cmd(program, &args)
    }

    fn tool_info(&self) -> Option<String> {
        // dcm2niix prints its version banner when run without arguments.
        let program = self.program.as_ref()?;
        let output = Command::new(program).output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

/// Drops `_key-…%…` placeholder segments from a file name.
pub fn clean_filename(name: &str) -> String {
    let (stem, ext) = split_nifti_name(name);
    let kept = stem
        .split('_')
        .filter(|part| !part.contains('%'))
        .collect::<Vec<_>>();
    format!("{}{ext}", kept.join("_"))
}

/// Glob pattern (without extension) matching what the converter produced
/// for the template `stem`.
pub fn output_pattern(stem: &str) -> String {
    let placeholder = Regex::new(r"%[^_]*").unwrap();
    placeholder.replace_all(stem, "*").into_owned()
}

/// Finds the converter output in `dir` for the template `stem`, preferring
/// `.nii.gz` over `.nii`; an uncompressed match is gzipped in place.
pub fn resolve_output(dir: &Path, stem: &str) -> Result<PathBuf, BidsError> {
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = output_pattern(stem);
    for ext in [".nii.gz", ".nii"] {
        let full = format!("{base}/{pattern}{ext}");
        let paths = glob::glob(&full)
            .map_err(|err| BidsError::Filesystem(err.to_string()))?
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        let Some(found) = newest(&paths) else {
            continue;
        };
        if paths.len() > 1 {
            warn!(
                pattern = %full,
                matches = paths.len(),
                chosen = %found.display(),
                "several converter outputs matched, keeping the newest"
            );
        }
        if ext == ".nii" {
            return fs_util::gzip_file(&found);
        }
        return Ok(found);
    }
    Err(BidsError::UnresolvedOutput(format!(
        "{}/{pattern}.nii[.gz]",
        dir.display()
    )))
}

fn newest(paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .max_by_key(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionResult {
    pub source: PathBuf,
    pub desired: PathBuf,
    pub actual: PathBuf,
}

/// Converts one separated set to its destination and regenerates the
/// destination manifest.
pub fn convert_set<C: Converter>(
    converter: &C,
    format: SourceFormat,
    set_dir: &Path,
    target: &BidsPath,
) -> Result<ConversionResult, BidsError> {
    let dest_dir = target.dir().to_path_buf();
    fs::create_dir_all(&dest_dir).map_err(|err| fs_err("create dir", &dest_dir, err))?;
    let actual = if format.needs_converter() {
        let file_name = target.file_name();
        let (stem, _) = split_nifti_name(&file_name);
        let output = converter.convert(set_dir, &dest_dir, stem)?;
        if !output.stderr.is_empty() {
            warn!(set = %set_dir.display(), stderr = %output.stderr, "converter reported warnings");
        }
        resolve_output(&dest_dir, stem)?
    } else {
        copy_nifti(set_dir, target)?
    };
    Manifest::refresh(&dest_dir, false)?;
    info!(set = %set_dir.display(), output = %actual.display(), "set converted");
    Ok(ConversionResult {
        source: set_dir.to_path_buf(),
        desired: target.path.clone(),
        actual,
    })
}

/// Copies the set's single NIfTI image and its sidecars to the destination.
pub fn copy_nifti(set_dir: &Path, target: &BidsPath) -> Result<PathBuf, BidsError> {
    let image = nifti_image(set_dir)?;
    let image_name = fs_util::file_name(&image);
    let (image_stem, image_ext) = split_nifti_name(&image_name);

    let dest_dir = target.dir();
    let clean = clean_filename(&target.file_name());
    let (target_stem, _) = split_nifti_name(&clean);
    let actual = if image_ext.eq_ignore_ascii_case(".nii") {
        let plain = dest_dir.join(format!("{target_stem}.nii"));
        fs::copy(&image, &plain).map_err(|err| fs_err("copy", &image, err))?;
        fs_util::gzip_file(&plain)?
    } else {
        let gz = dest_dir.join(format!("{target_stem}.nii.gz"));
        fs::copy(&image, &gz).map_err(|err| fs_err("copy", &image, err))?;
        gz
    };

    for dir in [set_dir.join(SIDECAR_DIR), set_dir.to_path_buf()] {
        for ext in SIDECAR_EXTENSIONS {
            let sidecar = dir.join(format!("{image_stem}.{ext}"));
            if sidecar.is_file() {
                let dest = dest_dir.join(format!("{target_stem}.{ext}"));
                fs::copy(&sidecar, &dest).map_err(|err| fs_err("copy", &sidecar, err))?;
            }
        }
    }
    Ok(actual)
}

fn nifti_image(set_dir: &Path) -> Result<PathBuf, BidsError> {
    let manifest = match Manifest::load(set_dir) {
        Ok(manifest) => manifest,
        Err(_) => Manifest::scan(set_dir, false)?,
    };
    manifest
        .sorted_by_index()
        .into_iter()
        .map(|entry| entry.path())
        .find(|path| {
            let name = fs_util::file_name(path);
            !name.starts_with('.') && fs_util::is_nifti_name(&name)
        })
        .ok_or_else(|| BidsError::UnresolvedOutput(format!("no NIfTI image in {}", set_dir.display())))
}
