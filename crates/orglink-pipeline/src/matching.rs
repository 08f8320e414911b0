//! Mutual-best-match reduction of scored links.
//!
//! Two greedy passes turn the many-to-many candidate table into a 1:1 (or
//! unmatched) mapping:
//!
//! 1. each source keeps its best target;
//! 2. each target keeps its best source, every other source pointing at it
//!    is demoted to unlinked.
//!
//! "Best" means smallest `distance` along the linked dimension, ties broken
//! by highest similarity, remaining ties by table order. This is a local
//! heuristic, not a globally optimal assignment.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::similarity::{CandidateLink, LinkTarget};
use crate::types::SegmentationId;

/// Result of [`select_mutual_best`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedLinks {
    /// One row per source, in first-seen source order.
    pub links: Vec<CandidateLink>,
    /// Sources whose target was claimed by a better source.
    pub demoted: usize,
}

impl MatchedLinks {
    /// Number of rows that still carry a target.
    #[must_use]
    pub fn linked(&self) -> usize {
        self.links.iter().filter(|l| l.target.is_some()).count()
    }
}

/// Ranking of two targets: `Less` means `a` is preferred.
fn rank(a: &LinkTarget, b: &LinkTarget) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then_with(|| b.similarity.total_cmp(&a.similarity))
}

/// Reduce `links` to at most one link per source and per target.
///
/// Every source present in `links` is present in the result exactly once.
#[must_use]
pub fn select_mutual_best(links: Vec<CandidateLink>) -> MatchedLinks {
    // Pass 1: best target per source.
    let mut by_source: HashMap<SegmentationId, usize> = HashMap::new();
    let mut kept: Vec<CandidateLink> = Vec::with_capacity(links.len());
    for link in links {
        match by_source.get(&link.source) {
            None => {
                by_source.insert(link.source, kept.len());
                kept.push(link);
            }
            Some(&slot) => {
                let better = match (&link.target, &kept[slot].target) {
                    (Some(new), Some(old)) => rank(new, old) == Ordering::Less,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if better {
                    kept[slot] = link;
                }
            }
        }
    }

    // Pass 2: best source per target.
    let mut by_target: HashMap<SegmentationId, usize> = HashMap::new();
    for (slot, link) in kept.iter().enumerate() {
        let Some(target) = &link.target else {
            continue;
        };
        match by_target.get(&target.id) {
            Some(&best) => {
                let incumbent = kept[best].target.as_ref();
                if incumbent.is_some_and(|old| rank(target, old) == Ordering::Less) {
                    by_target.insert(target.id, slot);
                }
            }
            None => {
                by_target.insert(target.id, slot);
            }
        }
    }

    let mut demoted = 0;
    for (slot, link) in kept.iter_mut().enumerate() {
        let claimed_elsewhere = link
            .target
            .as_ref()
            .is_some_and(|t| by_target.get(&t.id) != Some(&slot));
        if claimed_elsewhere {
            link.target = None;
            demoted += 1;
        }
    }

    MatchedLinks {
        links: kept,
        demoted,
    }
}
