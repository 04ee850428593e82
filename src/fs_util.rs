use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::BidsError;

pub fn fs_err(context: &str, path: &Path, err: io::Error) -> BidsError {
    BidsError::Filesystem(format!("{context} {}: {err}", path.display()))
}

/// Moves a file, degrading to copy + delete when a rename is impossible
/// (typically across filesystems).
pub fn move_file(from: &Path, to: &Path) -> Result<(), BidsError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| fs_err("create dir", parent, err))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|err| fs_err("copy", from, err))?;
    fs::remove_file(from).map_err(|err| fs_err("remove", from, err))?;
    Ok(())
}

/// Gzips `path` into `path.gz` and removes the uncompressed file.
pub fn gzip_file(path: &Path) -> Result<PathBuf, BidsError> {
    let mut target = path.as_os_str().to_owned();
    target.push(".gz");
    let target = PathBuf::from(target);

    let input = fs::File::open(path).map_err(|err| fs_err("open", path, err))?;
    let output = fs::File::create(&target).map_err(|err| fs_err("create", &target, err))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder)
        .map_err(|err| fs_err("compress", path, err))?;
    encoder
        .finish()
        .map_err(|err| fs_err("finish gzip", &target, err))?;
    fs::remove_file(path).map_err(|err| fs_err("remove", path, err))?;
    Ok(target)
}

/// Inverse of [`gzip_file`]: writes the decompressed payload next to the
/// archive (without the `.gz` suffix) and keeps the archive.
pub fn gunzip_file(path: &Path) -> Result<PathBuf, BidsError> {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .and_then(|value| value.strip_suffix(".gz"))
        .ok_or_else(|| BidsError::Filesystem(format!("not a .gz file: {}", path.display())))?;
    let target = path.with_file_name(name);

    let input = fs::File::open(path).map_err(|err| fs_err("open", path, err))?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut output = fs::File::create(&target).map_err(|err| fs_err("create", &target, err))?;
    io::copy(&mut decoder, &mut output).map_err(|err| fs_err("decompress", path, err))?;
    Ok(target)
}

/// Copies every entry of `source` into `dest`, preserving subdirectories.
pub fn copy_dir_contents(source: &Path, dest: &Path) -> Result<usize, BidsError> {
    fs::create_dir_all(dest).map_err(|err| fs_err("create dir", dest, err))?;
    let mut copied = 0;
    let mut stack = vec![source.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|err| fs_err("read dir", &dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| fs_err("read dir", &dir, err))?;
            let path = entry.path();
            let relative = path
                .strip_prefix(source)
                .map_err(|err| BidsError::Filesystem(err.to_string()))?;
            let target = dest.join(relative);
            if path.is_dir() {
                fs::create_dir_all(&target).map_err(|err| fs_err("create dir", &target, err))?;
                stack.push(path);
            } else {
                fs::copy(&path, &target).map_err(|err| fs_err("copy", &path, err))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// File name split into stem and extension, treating `.nii.gz` as one
/// extension.
pub fn split_nifti_name(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        let cut = name.len() - ".nii.gz".len();
        return (&name[..cut], &name[cut..]);
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

pub fn is_nifti_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".nii") || lower.ends_with(".nii.gz")
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default()
}
