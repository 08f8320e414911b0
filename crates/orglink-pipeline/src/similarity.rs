//! Similarity scoring of candidate pairs.
//!
//! Both linking modes share the overlap term, the IoU of the healed
//! segmentation-space shapes, and differ in the distance penalty:
//!
//! - rounds: `IoU * exp(-decay * manhattan)` over shift-corrected
//!   microscope centroids, with a hard cutoff on the corrected distance;
//! - stack: `IoU * exp(-decay * euclidean)` over raw microscope centroids.

use geo::{Area, BooleanOps, MultiPolygon};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::candidates::CandidatePair;
use crate::config::{RoundLinkingConfig, StackLinkingConfig};
use crate::partition::PartitionEntry;
use crate::shift::ShiftTable;
use crate::types::{ObjectId, SegmentationId};

/// Intersection-over-union of two shapes.
///
/// `None` when the union has zero or non-finite area.
#[must_use]
pub fn overlap_ratio(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Option<f64> {
    let union = a.union(b).unsigned_area();
    if !(union.is_finite() && union > 0.0) {
        return None;
    }
    let intersection = a.intersection(b).unsigned_area();
    Some((intersection / union).clamp(0.0, 1.0))
}

/// Why a candidate pair was not scored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Exclusion {
    /// One of the two rounds has no drift estimate.
    MissingShift {
        /// The round without an estimate.
        round: i64,
    },
    /// The corrected centroid distance reached the cutoff.
    BeyondCutoff {
        /// Corrected Manhattan distance.
        distance: f64,
    },
    /// One of the two shapes has no centroid, or together they enclose
    /// no area.
    DegenerateGeometry,
}

/// Outcome of scoring one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairScore {
    /// The pair is a valid link candidate with this similarity.
    Scored(f64),
    /// The pair takes no further part in linking.
    Excluded(Exclusion),
}

impl PairScore {
    /// The similarity of a scored pair.
    #[must_use]
    pub const fn similarity(self) -> Option<f64> {
        match self {
            Self::Scored(similarity) => Some(similarity),
            Self::Excluded(_) => None,
        }
    }
}

/// Scoring rule for one linking mode.
#[derive(Debug, Clone, Copy)]
pub enum Scorer<'a> {
    /// Organoids across rounds, corrected by the partition's shift table.
    Rounds {
        /// Round parameters.
        config: &'a RoundLinkingConfig,
        /// Drift estimates of the partition.
        shifts: &'a ShiftTable,
    },
    /// Cells across z-stack planes.
    Stack {
        /// Stack parameters.
        config: &'a StackLinkingConfig,
    },
}

impl Scorer<'_> {
    /// Score `source` against `target`.
    #[must_use]
    pub fn score(&self, source: &PartitionEntry<'_>, target: &PartitionEntry<'_>) -> PairScore {
        let (Some(from), Some(to)) = (source.geometry.centroid, target.geometry.centroid) else {
            return PairScore::Excluded(Exclusion::DegenerateGeometry);
        };
        let penalty = match self {
            Self::Rounds { config, shifts } => {
                let Some(from) = shifts.correct(source.position, from) else {
                    return PairScore::Excluded(Exclusion::MissingShift {
                        round: source.position,
                    });
                };
                let Some(to) = shifts.correct(target.position, to) else {
                    return PairScore::Excluded(Exclusion::MissingShift {
                        round: target.position,
                    });
                };
                let distance = from.manhattan_distance(to);
                if distance.is_nan() || distance >= config.max_distance {
                    return PairScore::Excluded(Exclusion::BeyondCutoff { distance });
                }
                (-config.distance_decay * distance).exp()
            }
            Self::Stack { config } => (-config.distance_decay * from.distance(to)).exp(),
        };
        match overlap_ratio(&source.geometry.healed, &target.geometry.healed) {
            Some(iou) => PairScore::Scored(iou * penalty),
            None => PairScore::Excluded(Exclusion::DegenerateGeometry),
        }
    }
}

/// Target side of a scored link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Target segmentation.
    pub id: SegmentationId,
    /// Target position along the linked dimension.
    pub position: i64,
    /// Target label.
    pub label: i64,
    /// Object the target already belongs to.
    pub object_id: Option<ObjectId>,
    /// Similarity score in `[0, 1]`.
    pub similarity: f64,
    /// `target.position - source.position`, used for tie-breaking.
    pub distance: i64,
}

/// A source with at most one scored target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateLink {
    /// Source segmentation.
    pub source: SegmentationId,
    /// Source position along the linked dimension.
    pub source_position: i64,
    /// Source label.
    pub source_label: i64,
    /// Object the source already belongs to.
    pub source_object: Option<ObjectId>,
    /// Scored target, `None` for an unlinked source.
    pub target: Option<LinkTarget>,
}

/// Scored links plus exclusion counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredLinks {
    /// Source-complete link rows.
    pub links: Vec<CandidateLink>,
    /// Pairs that were scored.
    pub scored: usize,
    /// Pairs dropped for a missing shift.
    pub missing_shift: usize,
    /// Pairs dropped at the distance cutoff.
    pub beyond_cutoff: usize,
    /// Pairs dropped for degenerate geometry.
    pub degenerate: usize,
}

/// Score every candidate pair.
///
/// Excluded pairs are dropped. A source left without any scored target
/// keeps a single row with `target: None`, so every entry still appears as
/// a source exactly as in `pairs`.
#[must_use]
pub fn score_candidates(
    entries: &[PartitionEntry<'_>],
    pairs: &[CandidatePair],
    scorer: &Scorer<'_>,
) -> ScoredLinks {
    let mut out = ScoredLinks::default();
    let mut start = 0;
    while start < pairs.len() {
        let source = pairs[start].source;
        let end = start + pairs[start..].partition_point(|p| p.source == source);
        let s = &entries[source];
        let before = out.links.len();

        for target in pairs[start..end].iter().filter_map(|p| p.target) {
            let t = &entries[target];
            match scorer.score(s, t) {
                PairScore::Scored(similarity) => {
                    out.scored += 1;
                    out.links.push(CandidateLink {
                        source: s.id,
                        source_position: s.position,
                        source_label: s.label,
                        source_object: s.object_id,
                        target: Some(LinkTarget {
                            id: t.id,
                            position: t.position,
                            label: t.label,
                            object_id: t.object_id,
                            similarity,
                            distance: t.position - s.position,
                        }),
                    });
                }
                PairScore::Excluded(reason) => {
                    debug!("excluded {} -> {}: {reason:?}", s.id, t.id);
                    match reason {
                        Exclusion::MissingShift { .. } => out.missing_shift += 1,
                        Exclusion::BeyondCutoff { .. } => out.beyond_cutoff += 1,
                        Exclusion::DegenerateGeometry => out.degenerate += 1,
                    }
                }
            }
        }

        if out.links.len() == before {
            out.links.push(CandidateLink {
                source: s.id,
                source_position: s.position,
                source_label: s.label,
                source_object: s.object_id,
                target: None,
            });
        }
        start = end;
    }
    out
}
