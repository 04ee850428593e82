use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::BidsError;
use crate::formats::{CheckReport, HeaderMap, normalize_key};

/// Marker of the column-legend line that opens the image information table.
const IMAGE_TABLE_MARKER: &str = "#  sl ec  dyn";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParHeader {
    pub scan_resolution: Option<(u32, u32)>,
    pub max_slices: Option<u32>,
    pub max_dynamics: Option<u32>,
    pub max_echoes: Option<u32>,
    pub max_phases: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRow {
    pub slice: u32,
    pub echo: u32,
    pub dynamic: u32,
    pub phase: u32,
    pub image_type: u32,
    pub sequence: u32,
    pub index: u32,
    pub bit_depth: u32,
    pub scan_percent: u32,
    pub recon_x: u32,
    pub recon_y: u32,
}

fn read_text(path: &Path) -> Result<String, BidsError> {
    let bytes = fs::read(path).map_err(|err| BidsError::HeaderRead {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn parse_header(text: &str) -> ParHeader {
    let pair = Regex::new(r":\s*(\d+)\s+(\d+)").unwrap();
    let single = Regex::new(r":\s*(\d+)").unwrap();
    let first_number = |line: &str| {
        single
            .captures(line)
            .and_then(|caps| caps[1].parse::<u32>().ok())
    };

    let mut header = ParHeader::default();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with(IMAGE_TABLE_MARKER) {
            break;
        }
        if line.contains("Scan resolution") {
            if let Some(caps) = pair.captures(line) {
                if let (Ok(x), Ok(y)) = (caps[1].parse(), caps[2].parse()) {
                    header.scan_resolution = Some((x, y));
                }
            }
        } else if line.contains("Max. number of slices/locations") {
            header.max_slices = first_number(line);
        } else if line.contains("Max. number of dynamics") {
            header.max_dynamics = first_number(line);
        } else if line.contains("Max. number of echoes") {
            header.max_echoes = first_number(line);
        } else if line.contains("Max. number of cardiac phases") {
            header.max_phases = first_number(line);
        }
    }
    header
}

/// Parses the image information table. Rows with fewer than ten columns or
/// non-integer leading columns are skipped.
pub fn parse_image_rows(text: &str) -> Vec<ImageRow> {
    let mut rows = Vec::new();
    let mut in_table = false;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with(IMAGE_TABLE_MARKER) {
            in_table = true;
            continue;
        }
        if !in_table || line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts = line.split_whitespace().collect::<Vec<_>>();
        if parts.len() < 10 {
            continue;
        }
        let take = |idx: usize| parts.get(idx).and_then(|value| value.parse::<u32>().ok());
        let recon_y_idx = if parts.len() > 10 { 10 } else { 9 };
        let row = (|| {
            Some(ImageRow {
                slice: take(0)?,
                echo: take(1)?,
                dynamic: take(2)?,
                phase: take(3)?,
                image_type: take(4)?,
                sequence: take(5)?,
                index: take(6)?,
                bit_depth: take(7)?,
                scan_percent: take(8)?,
                recon_x: take(9)?,
                recon_y: take(recon_y_idx)?,
            })
        })();
        if let Some(row) = row {
            rows.push(row);
        }
    }
    rows
}

/// Structural check of one PAR/REC pair.
///
/// Errors: missing or non-positive header dimensions, no image rows, row
/// count differing from slices × dynamics × echoes × phases, REC size
/// differing from the geometry of the first row, non-contiguous image
/// indices, and mixed bit depth or reconstruction size. Missing
/// slice/dynamic/echo/phase combinations are only warned about.
pub fn check_pair(par: &Path, rec: &Path) -> Result<CheckReport, BidsError> {
    let text = read_text(par)?;
    let rec_size = fs::metadata(rec)
        .map_err(|err| BidsError::HeaderRead {
            path: rec.to_path_buf(),
            message: err.to_string(),
        })?
        .len();
    Ok(check_contents(&text, rec_size))
}

pub fn check_contents(text: &str, rec_size: u64) -> CheckReport {
    let mut report = CheckReport::default();
    let header = parse_header(text);
    let rows = parse_image_rows(text);

    let fields = [
        ("max_slices", header.max_slices),
        ("max_dynamics", header.max_dynamics),
        ("max_echoes", header.max_echoes),
        ("max_phases", header.max_phases),
    ];
    for (name, value) in fields {
        match value {
            None => report.error(format!("missing header field {name}")),
            Some(0) => report.error(format!("invalid {name}: 0")),
            Some(_) => {}
        }
    }

    let Some(first) = rows.first().copied() else {
        report.error("image information table is empty");
        return report;
    };

    let slices = header.max_slices.unwrap_or(0);
    let dynamics = header.max_dynamics.unwrap_or(0);
    let echoes = header.max_echoes.unwrap_or(1);
    let phases = header.max_phases.unwrap_or(1);
    let expected_rows = [slices, dynamics, echoes, phases]
        .into_iter()
        .try_fold(1u64, |acc, value| acc.checked_mul(value as u64));
    match expected_rows {
        None => report.error(format!(
            "image count overflows: {slices} x {dynamics} x {echoes} x {phases}"
        )),
        Some(expected) => {
            if rows.len() as u64 != expected {
                report.error(format!(
                    "image count mismatch: expected {expected}, found {}",
                    rows.len()
                ));
            }
            let present = rows
                .iter()
                .filter(|row| {
                    (1..=slices).contains(&row.slice)
                        && (1..=dynamics).contains(&row.dynamic)
                        && (1..=echoes).contains(&row.echo)
                        && (1..=phases).contains(&row.phase)
                })
                .map(|row| (row.slice, row.dynamic, row.echo, row.phase))
                .collect::<BTreeSet<_>>();
            let missing = expected.saturating_sub(present.len() as u64);
            if missing > 0 {
                report.warn(format!("{missing} slice/dynamic/echo/phase combinations missing"));
            }
        }
    }

    let expected_size = [
        first.recon_x as u64,
        first.recon_y as u64,
        rows.len() as u64,
        (first.bit_depth / 8) as u64,
    ]
    .into_iter()
    .try_fold(1u64, |acc, value| acc.checked_mul(value));
    match expected_size {
        Some(expected) if expected == rec_size => {}
        Some(expected) => report.error(format!(
            "REC size mismatch: expected {expected} bytes, found {rec_size}"
        )),
        None => report.error("REC size overflows the image geometry"),
    }

    let mut indices = rows.iter().map(|row| row.index).collect::<Vec<_>>();
    indices.sort_unstable();
    let contiguous = indices
        .iter()
        .zip(0u32..)
        .all(|(index, expected)| *index == expected);
    if !contiguous {
        report.error("image indices are not contiguous from 0");
    }

    let homogeneous = rows.iter().all(|row| {
        row.bit_depth == first.bit_depth
            && row.recon_x == first.recon_x
            && row.recon_y == first.recon_y
    });
    if !homogeneous {
        report.error("bit depth or reconstruction size differs between images");
    }

    report
}

/// Every `key : value` line of the PAR file, keyed by the normalized key.
pub fn read_metadata(par: &Path) -> Result<HeaderMap, BidsError> {
    let text = read_text(par)?;
    Ok(metadata_from_text(&text))
}

pub fn metadata_from_text(text: &str) -> HeaderMap {
    let mut metadata = HeaderMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        metadata.insert(normalize_key(key.trim()), value.trim().to_string());
    }
    metadata
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PAR text with `slices` single-dynamic 4x4 16-bit images.
    pub fn par_text(slices: u32, protocol: &str) -> String {
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
        text
    }

    pub fn rec_size(slices: u32) -> u64 {
        4 * 4 * slices as u64 * 2
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{par_text, rec_size};
    use super::*;

    #[test]
    fn header_and_rows_parse() {
        let text = par_text(3, "T1W_3D");
        let header = parse_header(&text);
        assert_eq!(header.max_slices, Some(3));
        assert_eq!(header.max_dynamics, Some(1));
        assert_eq!(header.scan_resolution, Some((4, 4)));
        let rows = parse_image_rows(&text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].index, 2);
        assert_eq!(rows[0].bit_depth, 16);
    }

    #[test]
    fn consistent_pair_is_valid() {
        let report = check_contents(&par_text(3, "T1W_3D"), rec_size(3));
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn wrong_rec_size_is_invalid() {
        let report = check_contents(&par_text(3, "T1W_3D"), rec_size(3) - 2);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("REC size")));
    }

    #[test]
    fn missing_rows_are_invalid() {
        let text = par_text(3, "T1W_3D").replace(
            ".    Max. number of slices/locations    :   3",
            ".    Max. number of slices/locations    :   4",
        );
        let report = check_contents(&text, rec_size(3));
        assert!(report.errors.iter().any(|e| e.contains("image count")));
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn missing_header_field_is_invalid() {
        let text =
            par_text(2, "T1W_3D").replace(".    Max. number of dynamics            :   1\n", "");
        let report = check_contents(&text, rec_size(2));
        assert!(report.errors.iter().any(|e| e.contains("max_dynamics")));
    }

    #[test]
    fn oversized_header_is_rejected_without_enumeration() {
        let huge = u32::MAX.to_string();
        let text = par_text(1, "T1W_3D")
            .replace(":   1\n", &format!(":   {huge}\n"))
            .replace(
                ".    Max. number of slices/locations    :   1",
                &format!(".    Max. number of slices/locations    :   {huge}"),
            );
        let header = parse_header(&text);
        assert_eq!(header.max_slices, Some(u32::MAX));
        assert_eq!(header.max_phases, Some(u32::MAX));

        let report = check_contents(&text, rec_size(1));
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("overflows")));
    }

    #[test]
    fn large_header_with_few_rows_reports_missing_count() {
        let text = par_text(1, "T1W_3D")
            .replace(
                ".    Max. number of slices/locations    :   1",
                ".    Max. number of slices/locations    :   2000",
            )
            .replace(
                ".    Max. number of dynamics            :   1",
                ".    Max. number of dynamics            :   2000",
            )
            .replace(
                ".    Max. number of echoes              :   1",
                ".    Max. number of echoes              :   1000",
            );
        let report = check_contents(&text, rec_size(1));
        assert!(report.errors.iter().any(|e| e.contains("image count mismatch")));
        assert!(
            report
                .warnings
                .iter()
                .any(|w| w.starts_with("3999999999 "))
        );
    }

    #[test]
    fn metadata_keys_are_normalized() {
        let metadata = metadata_from_text(&par_text(1, "T1W_3D"));
        assert_eq!(metadata.get("protocolname").map(String::as_str), Some("T1W_3D"));
        assert_eq!(
            metadata.get("preparationdirection").map(String::as_str),
            Some("Anterior-Posterior")
        );
    }
}
