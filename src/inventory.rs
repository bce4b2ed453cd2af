use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use camino::Utf8Path;
use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::domain::Timestamp;
use crate::error::ArchiveError;
use crate::timegrid;

/// Outcome of one local directory scan. `skipped` counts files present in
/// the directory that matched no known filename convention; they are
/// excluded, never an error.
#[derive(Debug, Default)]
pub struct InventoryScan {
    pub found: BTreeSet<Timestamp>,
    pub skipped: usize,
}

impl InventoryScan {
    pub fn sorted(&self) -> Vec<Timestamp> {
        self.found.iter().copied().collect()
    }
}

/// Scans a directory tree for frame files and extracts their capture
/// timestamps. A missing directory yields an empty scan.
pub fn scan(dir: &Utf8Path) -> Result<InventoryScan, ArchiveError> {
    let mut result = InventoryScan::default();
    if !dir.as_std_path().exists() {
        return Ok(result);
    }

    let mut stack = vec![dir.as_std_path().to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
            let path: PathBuf = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                result.skipped += 1;
                continue;
            };
            match timestamp_from_filename(name) {
                Some(timestamp) => {
                    result.found.insert(timestamp);
                }
                None => result.skipped += 1,
            }
        }
    }

    if result.skipped > 0 {
        debug!(
            skipped = result.skipped,
            dir = %dir,
            "ignored files matching no known naming convention"
        );
    }
    Ok(result)
}

/// Tries each known filename convention in order; first match wins.
pub fn timestamp_from_filename(name: &str) -> Option<Timestamp> {
    timegrid::timestamp_from_name(name)
        .or_else(|| from_day_of_year_name(name))
        .or_else(|| from_iso_name(name))
}

/// CDN-style names lead with `YYYYDDDHHMM` (year, day-of-year, time).
fn from_day_of_year_name(name: &str) -> Option<Timestamp> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^(\d{4})(\d{3})(\d{2})(\d{2})_").unwrap());
    let captures = pattern.captures(name)?;
    let year: i32 = captures[1].parse().ok()?;
    let ordinal: u32 = captures[2].parse().ok()?;
    let hour: u32 = captures[3].parse().ok()?;
    let minute: u32 = captures[4].parse().ok()?;
    let date = NaiveDate::from_yo_opt(year, ordinal)?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(Timestamp::from_datetime(naive.and_utc()))
}

/// Date-and-time names like `2026-08-23T19-50` or `2026-08-23_1950`.
fn from_iso_name(name: &str) -> Option<Timestamp> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})[T_](\d{2})[-:]?(\d{2})").unwrap()
    });
    let captures = pattern.captures(name)?;
    let year: i32 = captures[1].parse().ok()?;
    let month: u32 = captures[2].parse().ok()?;
    let day: u32 = captures[3].parse().ok()?;
    let hour: u32 = captures[4].parse().ok()?;
    let minute: u32 = captures[5].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(Timestamp::from_datetime(naive.and_utc()))
}
