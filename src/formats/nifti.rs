use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::BidsError;
use crate::formats::CheckReport;

const NIFTI1_HEADER_SIZE: usize = 348;
const NIFTI2_HEADER_SIZE: usize = 540;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiftiVersion {
    One,
    Two,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub version: NiftiVersion,
    pub little_endian: bool,
    /// `dim[0..8]`; `dim[0]` is the number of used dimensions.
    pub dim: [i64; 8],
    pub bitpix: i16,
    pub vox_offset: f64,
}

impl NiftiHeader {
    pub fn ndim(&self) -> i64 {
        self.dim[0]
    }

    /// Voxel payload size implied by dimensions and bit depth; `None` when the
    /// header is not internally consistent.
    pub fn expected_payload(&self) -> Option<u64> {
        let ndim = usize::try_from(self.ndim()).ok()?;
        if !(1..=7).contains(&ndim) || self.bitpix <= 0 {
            return None;
        }
        let mut voxels: u64 = 1;
        for extent in &self.dim[1..=ndim] {
            voxels = voxels.checked_mul(u64::try_from(*extent).ok()?)?;
        }
        voxels.checked_mul(self.bitpix as u64 / 8)
    }
}

struct Fields<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl Fields<'_> {
    fn take<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[offset..offset + N]);
        out
    }

    fn i16(&self, offset: usize) -> i16 {
        let raw = self.take::<2>(offset);
        if self.little_endian { i16::from_le_bytes(raw) } else { i16::from_be_bytes(raw) }
    }

    fn i64(&self, offset: usize) -> i64 {
        let raw = self.take::<8>(offset);
        if self.little_endian { i64::from_le_bytes(raw) } else { i64::from_be_bytes(raw) }
    }

    fn f32(&self, offset: usize) -> f32 {
        let raw = self.take::<4>(offset);
        if self.little_endian { f32::from_le_bytes(raw) } else { f32::from_be_bytes(raw) }
    }
}

/// Decodes a NIfTI-1 or NIfTI-2 header; byte order is inferred from
/// `sizeof_hdr`.
pub fn parse_header(bytes: &[u8]) -> Option<NiftiHeader> {
    if bytes.len() < 4 {
        return None;
    }
    let size_le = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let size_be = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let (version, little_endian) = match (size_le, size_be) {
        (348, _) => (NiftiVersion::One, true),
        (_, 348) => (NiftiVersion::One, false),
        (540, _) => (NiftiVersion::Two, true),
        (_, 540) => (NiftiVersion::Two, false),
        _ => return None,
    };
    let needed = match version {
        NiftiVersion::One => NIFTI1_HEADER_SIZE,
        NiftiVersion::Two => NIFTI2_HEADER_SIZE,
    };
    if bytes.len() < needed {
        return None;
    }
    let fields = Fields {
        bytes,
        little_endian,
    };
    let mut dim = [0i64; 8];
    let header = match version {
        NiftiVersion::One => {
            for (i, slot) in dim.iter_mut().enumerate() {
                *slot = fields.i16(40 + i * 2) as i64;
            }
            NiftiHeader {
                version,
                little_endian,
                dim,
                bitpix: fields.i16(72),
                vox_offset: fields.f32(108) as f64,
            }
        }
        NiftiVersion::Two => {
            for (i, slot) in dim.iter_mut().enumerate() {
                *slot = fields.i64(16 + i * 8);
            }
            NiftiHeader {
                version,
                little_endian,
                dim,
                bitpix: fields.i16(14),
                vox_offset: fields.i64(168) as f64,
            }
        }
    };
    Some(header)
}

fn header_err(path: &Path, message: impl Into<String>) -> BidsError {
    BidsError::HeaderRead {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn read_prefix(path: &Path) -> Result<Vec<u8>, BidsError> {
    let file = File::open(path).map_err(|err| header_err(path, err.to_string()))?;
    let reader = BufReader::new(file);
    let gzipped = path
        .to_string_lossy()
        .to_ascii_lowercase()
        .ends_with(".gz");
    let mut prefix = Vec::with_capacity(NIFTI2_HEADER_SIZE);
    let limit = NIFTI2_HEADER_SIZE as u64;
    let result = if gzipped {
        GzDecoder::new(reader).take(limit).read_to_end(&mut prefix)
    } else {
        reader.take(limit).read_to_end(&mut prefix)
    };
    result.map_err(|err| header_err(path, err.to_string()))?;
    Ok(prefix)
}

/// Header-only structural check of a NIfTI image.
pub fn check_image(path: &Path) -> Result<CheckReport, BidsError> {
    let prefix = read_prefix(path)?;
    let mut report = CheckReport::default();
    let Some(header) = parse_header(&prefix) else {
        report.error("not a NIfTI-1 or NIfTI-2 header");
        return Ok(report);
    };

    let ndim = header.ndim();
    if !(1..=7).contains(&ndim) {
        report.error(format!("dim[0] out of range: {ndim}"));
        return Ok(report);
    }
    if let Some(bad) = header.dim[1..=ndim as usize].iter().position(|d| *d <= 0) {
        report.error(format!("dim[{}] is not positive", bad + 1));
    }
    if ndim < 3 {
        report.error(format!("image has only {ndim} dimension(s)"));
    } else if ndim > 4 {
        report.warn(format!("image has {ndim} dimensions"));
    }

    let compressed = path
        .to_string_lossy()
        .to_ascii_lowercase()
        .ends_with(".gz");
    if !compressed && report.is_valid() {
        if let Some(payload) = header.expected_payload() {
            let size = std::fs::metadata(path)
                .map_err(|err| header_err(path, err.to_string()))?
                .len();
            let offset = header.vox_offset.max(0.0) as u64;
            if size.saturating_sub(offset) < payload / 2 {
                report.warn(format!(
                    "file holds {size} bytes, expected about {} for the voxel data",
                    payload + offset
                ));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Little-endian NIfTI-1 single-file image with the given dimensions and
    /// 16-bit voxels, zero-filled.
    pub fn nifti1_bytes(dims: &[i16]) -> Vec<u8> {
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
        header
    }
}
