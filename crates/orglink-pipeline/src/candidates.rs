//! Candidate pair discovery: a spatial self-join within one partition.
//!
//! Two segmentations are candidates when they sit in different groups of
//! the linked dimension (source strictly before target) and their
//! microscope-space bounding boxes, each grown by a fixed margin,
//! intersect. Boxes touching on an edge count as intersecting.
//!
//! The join is accelerated with one R\*-tree per group; results are
//! identical to testing every pair.

use std::collections::BTreeMap;

use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

use crate::partition::PartitionEntry;

/// A source paired with one target, or with none.
///
/// Indices refer to the entry slice the finder was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePair {
    /// Index of the source entry.
    pub source: usize,
    /// Index of the target entry, `None` when the source has no candidate.
    pub target: Option<usize>,
}

/// Envelope grown by `margin`, tagged with its entry index.
type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

fn expanded_aabb(entry: &PartitionEntry<'_>, margin: f64) -> Option<AABB<[f64; 2]>> {
    entry.geometry.expanded_envelope(margin).map(|r| {
        let min = r.min();
        let max = r.max();
        AABB::from_corners([min.x, min.y], [max.x, max.y])
    })
}

/// Find candidate pairs among `entries`.
///
/// For every pair of groups `g1 < g2` (by position), optionally limited to
/// `g2 - g1 <= max_gap`, every source in `g1` is paired with each target in
/// `g2` whose grown envelope intersects its own.
///
/// The result holds every entry as a source at least once: sources without
/// any target appear in a single row with `target: None`. Rows are sorted by
/// source index, then target index. No pair appears twice, in either
/// orientation, and no entry is paired with itself.
#[must_use]
pub fn find_candidates(
    entries: &[PartitionEntry<'_>],
    margin: f64,
    max_gap: Option<i64>,
) -> Vec<CandidatePair> {
    let mut groups: BTreeMap<i64, Vec<IndexedEnvelope>> = BTreeMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let group = groups.entry(entry.position).or_default();
        if let Some(aabb) = expanded_aabb(entry, margin) {
            group.push(GeomWithData::new(
                Rectangle::from_corners(aabb.lower(), aabb.upper()),
                index,
            ));
        }
    }
    let trees: BTreeMap<i64, RTree<IndexedEnvelope>> = groups
        .into_iter()
        .map(|(position, envelopes)| (position, RTree::bulk_load(envelopes)))
        .collect();

    let mut pairs = Vec::with_capacity(entries.len());
    for (source, entry) in entries.iter().enumerate() {
        let mut targets: Vec<usize> = Vec::new();
        let lower = entry.position.saturating_add(1);
        let upper = max_gap.map_or(i64::MAX, |gap| entry.position.saturating_add(gap));
        if let Some(query) = expanded_aabb(entry, margin)
            && lower <= upper
        {
            for (_, tree) in trees.range(lower..=upper) {
                targets.extend(
                    tree.locate_in_envelope_intersecting(&query)
                        .map(|hit| hit.data),
                );
            }
        }

        if targets.is_empty() {
            pairs.push(CandidatePair {
                source,
                target: None,
            });
        } else {
            targets.sort_unstable();
            pairs.extend(targets.into_iter().map(|target| CandidatePair {
                source,
                target: Some(target),
            }));
        }
    }
    pairs
}
