//! Robust estimate of stage drift between imaging rounds.
//!
//! Every round of a partition is registered against the reference round
//! (the lowest round present). For each reference segmentation, in id
//! order, the nearest candidate in the other round contributes one centroid
//! delta `reference - other`; the first `max_shift_samples` deltas are
//! reduced with a trimmed mean.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::candidates::CandidatePair;
use crate::config::RoundLinkingConfig;
use crate::partition::PartitionEntry;
use crate::types::{Point, Shift};

/// Per-round drift relative to the reference round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShiftTable {
    /// Lowest round of the partition, `None` when the partition is empty.
    pub reference: Option<i64>,
    /// Rounds with an estimate. The reference round maps to zero.
    pub shifts: BTreeMap<i64, Shift>,
    /// Number of samples behind each estimate.
    pub samples: BTreeMap<i64, usize>,
}

impl ShiftTable {
    /// Shift for `round`, `None` if no estimate could be made.
    #[must_use]
    pub fn get(&self, round: i64) -> Option<Shift> {
        self.shifts.get(&round).copied()
    }

    /// Centroid moved into the reference frame, `None` without an estimate.
    #[must_use]
    pub fn correct(&self, round: i64, centroid: Point) -> Option<Point> {
        self.get(round).map(|shift| centroid.shifted(shift))
    }
}

/// Reduce `samples` to one shift.
///
/// No samples give `None`, a single sample is returned as is. Otherwise the
/// x and y components are sorted independently and the mean of the index
/// window `[floor(n * trim_low), floor(n * trim_high))` is taken. An empty
/// window falls back to the plain mean.
#[must_use]
pub fn trimmed_mean(samples: &[Shift], trim_low: f64, trim_high: f64) -> Option<Shift> {
    match samples {
        [] => None,
        [only] => Some(*only),
        _ => {
            let mut xs: Vec<f64> = samples.iter().map(|s| s.dx).collect();
            let mut ys: Vec<f64> = samples.iter().map(|s| s.dy).collect();
            xs.sort_by(f64::total_cmp);
            ys.sort_by(f64::total_cmp);
            let (lo, hi) = trim_window(samples.len(), trim_low, trim_high);
            Some(Shift::new(
                window_mean(&xs, lo, hi),
                window_mean(&ys, lo, hi),
            ))
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn trim_window(n: usize, trim_low: f64, trim_high: f64) -> (usize, usize) {
    let scaled = n as f64;
    let lo = (scaled * trim_low).floor().max(0.0) as usize;
    let hi = ((scaled * trim_high).floor().max(0.0) as usize).min(n);
    (lo, hi)
}

#[allow(clippy::cast_precision_loss)]
fn window_mean(sorted: &[f64], lo: usize, hi: usize) -> f64 {
    let window = if lo < hi { &sorted[lo..hi] } else { sorted };
    window.iter().sum::<f64>() / window.len() as f64
}

/// Estimate the drift of every round in a partition.
///
/// `pairs` must come from [`find_candidates`](crate::candidates::find_candidates)
/// over the same `entries` without a gap limit, so every reference
/// segmentation is a source of its candidates in all later rounds.
#[must_use]
pub fn estimate_shifts(
    entries: &[PartitionEntry<'_>],
    pairs: &[CandidatePair],
    config: &RoundLinkingConfig,
) -> ShiftTable {
    let Some(reference) = entries.iter().map(|e| e.position).min() else {
        return ShiftTable::default();
    };

    let mut rounds: BTreeSet<i64> = entries.iter().map(|e| e.position).collect();
    rounds.remove(&reference);

    // Reference sources in id order; `pairs` is sorted by source index.
    let mut sources: Vec<usize> = (0..entries.len())
        .filter(|&i| entries[i].position == reference)
        .collect();
    sources.sort_by_key(|&i| entries[i].id);

    let mut table = ShiftTable {
        reference: Some(reference),
        ..ShiftTable::default()
    };
    table.shifts.insert(reference, Shift::ZERO);
    table.samples.insert(reference, 0);

    for &round in &rounds {
        let samples: Vec<Shift> = sources
            .iter()
            .filter_map(|&source| nearest_delta(entries, pairs, source, round))
            .take(config.max_shift_samples)
            .collect();
        table.samples.insert(round, samples.len());
        match trimmed_mean(&samples, config.trim_low, config.trim_high) {
            Some(shift) => {
                debug!(
                    "round {round}: shift ({:.3}, {:.3}) from {} samples",
                    shift.dx,
                    shift.dy,
                    samples.len()
                );
                table.shifts.insert(round, shift);
            }
            None => debug!("round {round}: no samples against reference round {reference}"),
        }
    }
    table
}

/// Delta from the nearest candidate of `source` in `round`.
fn nearest_delta(
    entries: &[PartitionEntry<'_>],
    pairs: &[CandidatePair],
    source: usize,
    round: i64,
) -> Option<Shift> {
    let from = entries[source].geometry.centroid?;
    let start = pairs.partition_point(|p| p.source < source);
    pairs[start..]
        .iter()
        .take_while(|p| p.source == source)
        .filter_map(|p| p.target)
        .filter(|&t| entries[t].position == round)
        .filter_map(|t| entries[t].geometry.centroid)
        .map(|to| (from.manhattan_distance(to), to))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, to)| Shift::new(from.x - to.x, from.y - to.y))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::affine::AffineTransform;
    use crate::candidates::find_candidates;
    use crate::projection::ProjectedSegmentation;
    use crate::types::{Contour, ImageType, SegmentationId, SegmentationRecord};

    fn geometry(id: u64, x: f64, y: f64) -> ProjectedSegmentation {
        let record = SegmentationRecord {
            id: SegmentationId(id),
            object_id: None,
            well: "A1".to_string(),
            fixation: "Day1".to_string(),
            time_point: 1,
            round: 1,
            z_index: 0,
            label: 1,
            image_type: ImageType::Label,
            contour: Contour::rectangle(x, y, x + 100.0, y + 100.0),
            seg_to_image: AffineTransform::IDENTITY,
            image_to_microscope: AffineTransform::IDENTITY,
        };
        ProjectedSegmentation::new(&record)
    }

    fn entries<'a>(geoms: &'a [ProjectedSegmentation], rounds: &[i64]) -> Vec<PartitionEntry<'a>> {
        geoms
            .iter()
            .zip(rounds)
            .map(|(g, &position)| PartitionEntry {
                id: g.id,
                label: 0,
                position,
                object_id: None,
                geometry: g,
            })
            .collect()
    }

    #[test]
    fn trimmed_mean_drops_outliers() {
        let samples = [
            Shift::new(1.0, 1.0),
            Shift::new(2.0, 2.0),
            Shift::new(3.0, 3.0),
            Shift::new(100.0, 100.0),
            Shift::new(-100.0, -100.0),
        ];
        assert_eq!(trimmed_mean(&samples, 0.2, 0.8), Some(Shift::new(2.0, 2.0)));
    }

    #[test]
    fn trimmed_mean_small_inputs() {
        assert_eq!(trimmed_mean(&[], 0.2, 0.8), None);
        let one = Shift::new(-4.0, 9.5);
        assert_eq!(trimmed_mean(&[one], 0.2, 0.8), Some(one));
        // n = 2 keeps index 0 of each sorted axis.
        let two = [Shift::new(5.0, -1.0), Shift::new(1.0, 3.0)];
        assert_eq!(trimmed_mean(&two, 0.2, 0.8), Some(Shift::new(1.0, -1.0)));
    }

    #[test]
    fn trimmed_mean_sorts_axes_independently() {
        let samples = [
            Shift::new(10.0, 0.0),
            Shift::new(0.0, 10.0),
            Shift::new(5.0, 5.0),
            Shift::new(6.0, 4.0),
            Shift::new(4.0, 6.0),
        ];
        // x sorted: 0 4 5 6 10 -> window [1, 4) -> 5; same for y.
        assert_eq!(trimmed_mean(&samples, 0.2, 0.8), Some(Shift::new(5.0, 5.0)));
    }

    #[test]
    fn empty_window_falls_back_to_plain_mean() {
        let samples = [Shift::new(1.0, 1.0), Shift::new(3.0, 5.0)];
        assert_eq!(trimmed_mean(&samples, 0.1, 0.2), Some(Shift::new(2.0, 3.0)));
    }

    #[test]
    fn reference_round_is_lowest_and_zero() {
        let geoms = vec![geometry(1, 0.0, 0.0), geometry(2, 30.0, -20.0)];
        let e = entries(&geoms, &[3, 5]);
        let pairs = find_candidates(&e, 100.0, None);
        let table = estimate_shifts(&e, &pairs, &RoundLinkingConfig::default());
        assert_eq!(table.reference, Some(3));
        assert_eq!(table.get(3), Some(Shift::ZERO));
        assert_eq!(table.get(5), Some(Shift::new(-30.0, 20.0)));
        assert_eq!(table.samples.get(&5), Some(&1));
    }

    #[test]
    fn round_without_candidates_has_no_shift() {
        let geoms = vec![geometry(1, 0.0, 0.0), geometry(2, 5000.0, 0.0)];
        let e = entries(&geoms, &[1, 2]);
        let pairs = find_candidates(&e, 100.0, None);
        let table = estimate_shifts(&e, &pairs, &RoundLinkingConfig::default());
        assert_eq!(table.get(2), None);
        assert_eq!(table.correct(2, Point::new(0.0, 0.0)), None);
        assert_eq!(table.samples.get(&2), Some(&0));
    }

    #[test]
    fn nearest_target_supplies_the_sample() {
        let geoms = vec![
            geometry(1, 0.0, 0.0),
            geometry(2, 50.0, 0.0),
            geometry(3, 10.0, 0.0),
        ];
        let e = entries(&geoms, &[1, 2, 2]);
        let pairs = find_candidates(&e, 100.0, None);
        let table = estimate_shifts(&e, &pairs, &RoundLinkingConfig::default());
        assert_eq!(table.get(2), Some(Shift::new(-10.0, 0.0)));
    }

    #[test]
    fn sample_limit_takes_first_sources_by_id() {
        let geoms = vec![
            geometry(2, 0.0, 0.0),
            geometry(1, 1000.0, 0.0),
            geometry(3, 20.0, 0.0),
            geometry(4, 1000.0, 40.0),
        ];
        let e = entries(&geoms, &[1, 1, 2, 2]);
        let pairs = find_candidates(&e, 100.0, None);
        let config = RoundLinkingConfig {
            max_shift_samples: 1,
            ..RoundLinkingConfig::default()
        };
        let table = estimate_shifts(&e, &pairs, &config);
        // seg#1 is the lowest id in the reference round.
        assert_eq!(table.get(2), Some(Shift::new(0.0, -40.0)));
    }

    #[test]
    fn empty_partition_has_no_reference() {
        let table = estimate_shifts(&[], &[], &RoundLinkingConfig::default());
        assert_eq!(table.reference, None);
        assert!(table.shifts.is_empty());
    }
}
