use std::collections::BTreeMap;

use chrono::Datelike;

use crate::domain::{Product, Satellite, Timestamp};
use crate::error::ArchiveError;

/// Upper bound on the sample prefix examined by interval auto-detection.
const DETECT_SAMPLE_LIMIT: usize = 48;

/// Share of consecutive deltas allowed to disagree with the detected
/// spacing before the schedule is declared undetectable.
const DETECT_TOLERANCE: f64 = 0.2;

/// Lazy sequence of expected capture timestamps, strictly increasing and
/// spaced by a fixed interval. Inclusive of `start`; inclusive of `end`
/// only when `end` lies exactly on the grid.
#[derive(Debug, Clone)]
pub struct TimeGrid {
    next: Option<Timestamp>,
    end: Timestamp,
    step_minutes: i64,
}

impl Iterator for TimeGrid {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Timestamp> {
        let current = self.next?;
        if current > self.end {
            self.next = None;
            return None;
        }
        self.next = Some(current.plus_minutes(self.step_minutes));
        Some(current)
    }
}

pub fn expected(
    start: Timestamp,
    end: Timestamp,
    interval_minutes: u32,
) -> Result<TimeGrid, ArchiveError> {
    if interval_minutes == 0 {
        return Err(ArchiveError::InvalidInterval);
    }
    if start > end {
        return Err(ArchiveError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(TimeGrid {
        next: Some(start),
        end,
        step_minutes: i64::from(interval_minutes),
    })
}

/// Infers the capture interval from a sorted sample of existing timestamps.
///
/// Takes a bounded prefix, computes consecutive deltas, and returns the mode.
/// Deltas that are whole multiples of the mode are tolerated (they are gaps,
/// not schedule changes); anything else counts against the tolerance.
pub fn detect_interval(samples: &[Timestamp]) -> Result<u32, ArchiveError> {
    let prefix: Vec<Timestamp> = samples.iter().take(DETECT_SAMPLE_LIMIT).copied().collect();
    if prefix.len() < 2 {
        return Err(ArchiveError::ScheduleUndetectable(format!(
            "need at least two samples, have {}",
            prefix.len()
        )));
    }

    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for pair in prefix.windows(2) {
        let delta = pair[0].minutes_until(&pair[1]);
        if delta <= 0 {
            return Err(ArchiveError::ScheduleUndetectable(
                "samples are not strictly increasing".to_string(),
            ));
        }
        *counts.entry(delta).or_insert(0) += 1;
    }

    // BTreeMap iteration is ascending, so ties resolve to the smaller delta.
    let mode = counts
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(delta, _)| *delta)
        .ok_or_else(|| ArchiveError::ScheduleUndetectable("no deltas".to_string()))?;

    let total: usize = counts.values().sum();
    let inconsistent: usize = counts
        .iter()
        .filter(|(delta, _)| *delta % mode != 0)
        .map(|(_, count)| *count)
        .sum();
    if (inconsistent as f64) / (total as f64) > DETECT_TOLERANCE {
        return Err(ArchiveError::ScheduleUndetectable(format!(
            "{inconsistent} of {total} deltas disagree with a {mode}-minute spacing"
        )));
    }

    u32::try_from(mode).map_err(|_| {
        ArchiveError::ScheduleUndetectable(format!("implausible spacing of {mode} minutes"))
    })
}

/// Canonical local filename for one frame: `{sat}_{product}_{YYYYMMDDHHMM}.{ext}`.
pub fn local_filename(satellite: Satellite, product: Product, timestamp: Timestamp) -> String {
    format!(
        "{}_{}_{}.{}",
        satellite.slug(),
        product.code(),
        timestamp.compact(),
        product.extension()
    )
}

/// Canonical remote identifier, prefix-addressable by day for listing.
pub fn remote_key(satellite: Satellite, product: Product, timestamp: Timestamp) -> String {
    format!(
        "{}{}",
        day_prefix(satellite, product, timestamp),
        local_filename(satellite, product, timestamp)
    )
}

pub fn day_prefix(satellite: Satellite, product: Product, timestamp: Timestamp) -> String {
    let date = timestamp.as_datetime();
    format!(
        "{}/{}/{:04}/{:02}/{:02}/",
        satellite.slug(),
        product.code(),
        date.year(),
        date.month(),
        date.day()
    )
}

/// Recovers the capture timestamp from a canonical filename or remote key.
/// Returns `None` for names that do not follow the canonical convention.
pub fn timestamp_from_name(name: &str) -> Option<Timestamp> {
    let basename = name.rsplit('/').next()?;
    let stem = basename.rsplit_once('.').map(|(stem, _)| stem)?;
    let compact = stem.rsplit('_').next()?;
    Timestamp::parse_compact(compact).ok()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn ts(compact: &str) -> Timestamp {
        Timestamp::parse_compact(compact).unwrap()
    }

    #[test]
    fn grid_is_strictly_increasing_and_evenly_spaced() {
        let grid: Vec<Timestamp> =
            expected(ts("202608230000"), ts("202608230100"), 10).unwrap().collect();
        assert_eq!(grid.len(), 7);
        for pair in grid.windows(2) {
            assert_eq!(pair[0].minutes_until(&pair[1]), 10);
        }
    }

    #[test]
    fn grid_excludes_unaligned_end() {
        let grid: Vec<Timestamp> =
            expected(ts("202608230000"), ts("202608230025"), 10).unwrap().collect();
        assert_eq!(grid.last().unwrap().compact(), "202608230020");
        assert_eq!(grid.len(), 3);
    }

    #[test]
    fn grid_single_point_when_start_equals_end() {
        let grid: Vec<Timestamp> =
            expected(ts("202608230000"), ts("202608230000"), 10).unwrap().collect();
        assert_eq!(grid, vec![ts("202608230000")]);
    }

    #[test]
    fn grid_rejects_zero_interval_and_inverted_range() {
        assert_matches!(
            expected(ts("202608230000"), ts("202608230100"), 0).unwrap_err(),
            ArchiveError::InvalidInterval
        );
        assert_matches!(
            expected(ts("202608230100"), ts("202608230000"), 10).unwrap_err(),
            ArchiveError::InvalidRange { .. }
        );
    }

    #[test]
    fn detect_interval_simple() {
        let samples = vec![ts("202608230000"), ts("202608230010"), ts("202608230020")];
        assert_eq!(detect_interval(&samples).unwrap(), 10);
    }

    #[test]
    fn detect_interval_tolerates_gaps() {
        // Missing frames produce deltas that are multiples of the spacing.
        let samples = vec![
            ts("202608230000"),
            ts("202608230010"),
            ts("202608230030"),
            ts("202608230040"),
            ts("202608230050"),
        ];
        assert_eq!(detect_interval(&samples).unwrap(), 10);
    }

    #[test]
    fn detect_interval_needs_two_samples() {
        assert_matches!(
            detect_interval(&[ts("202608230000")]).unwrap_err(),
            ArchiveError::ScheduleUndetectable(_)
        );
    }

    #[test]
    fn detect_interval_rejects_inconsistent_spacing() {
        let samples = vec![
            ts("202608230000"),
            ts("202608230007"),
            ts("202608230010"),
            ts("202608230023"),
        ];
        assert_matches!(
            detect_interval(&samples).unwrap_err(),
            ArchiveError::ScheduleUndetectable(_)
        );
    }

    #[test]
    fn naming_round_trips() {
        let stamp = ts("202608231950");
        let name = local_filename(Satellite::Goes16, Product::GeoColor, stamp);
        assert_eq!(name, "goes16_geocolor_202608231950.png");
        assert_eq!(timestamp_from_name(&name), Some(stamp));

        let key = remote_key(Satellite::Goes18, Product::Band13, stamp);
        assert_eq!(key, "goes18/band13/2026/08/23/goes18_band13_202608231950.png");
        assert_eq!(timestamp_from_name(&key), Some(stamp));
    }

    #[test]
    fn unrelated_names_do_not_parse() {
        assert_eq!(timestamp_from_name("README.md"), None);
        assert_eq!(timestamp_from_name("goes16_geocolor_notatime.png"), None);
    }
}
