//! Folding matched links into persistent objects.
//!
//! Rows are walked in ascending source position. A source without an
//! object opens a new one; an accepted link hands the source's object on to
//! its target. Because positions only grow along a chain, multi-hop chains
//! are built left to right in a single pass.
//!
//! An object id, once set, is never overwritten: a target that already
//! belongs to an object rejects every further link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::similarity::CandidateLink;
use crate::types::{ObjectId, ObjectType, SegmentationId};

/// Thread-safe, monotonically increasing source of object ids.
#[derive(Debug)]
pub struct ObjectIdAllocator {
    next: AtomicU64,
}

impl ObjectIdAllocator {
    /// Allocator whose first id is `first`.
    #[must_use]
    pub const fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocator that continues after the largest of `existing`.
    #[must_use]
    pub fn after<I>(existing: I) -> Self
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let first = existing
            .into_iter()
            .map(|id| id.0.saturating_add(1))
            .max()
            .unwrap_or(1);
        Self::new(first)
    }

    /// Hand out the next id.
    pub fn allocate(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// An object created during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedObject {
    /// Allocated id.
    pub id: ObjectId,
    /// Organoid or cell.
    pub object_type: ObjectType,
    /// Member segmentations in chain order.
    pub members: Vec<SegmentationId>,
}

/// A new segmentation-to-object assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Segmentation being assigned.
    pub segmentation: SegmentationId,
    /// Object it now belongs to.
    pub object: ObjectId,
}

/// Why a matched link was not followed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
    /// The target already belongs to an object.
    AlreadyAssigned {
        /// The target's existing object.
        object: ObjectId,
    },
    /// The link scored below the threshold.
    BelowThreshold {
        /// Link similarity.
        similarity: f64,
        /// Threshold in force.
        threshold: f64,
    },
}

/// A rejected link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Link source.
    pub source: SegmentationId,
    /// Link target.
    pub target: SegmentationId,
    /// Why it was rejected.
    pub reason: RejectReason,
}

/// Everything the chain builder decided for one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    /// Objects created in this partition.
    pub objects: Vec<LinkedObject>,
    /// New assignments, including those extending pre-existing objects.
    pub assignments: Vec<Assignment>,
    /// Links that were not followed.
    pub rejections: Vec<Rejection>,
    /// Chains that ended because the source had no target.
    pub unlinked: usize,
}

/// Walk `links` and assign object ids.
///
/// Rows are processed stably sorted by `source_position`. Object ids already
/// carried by sources or targets seed the state and are kept.
pub fn build_chains(
    links: &[CandidateLink],
    object_type: ObjectType,
    min_similarity: f64,
    allocator: &ObjectIdAllocator,
) -> ChainOutcome {
    let mut order: Vec<&CandidateLink> = links.iter().collect();
    order.sort_by_key(|l| l.source_position);

    let mut owner: HashMap<SegmentationId, ObjectId> = HashMap::new();
    for link in links {
        if let Some(object) = link.source_object {
            owner.insert(link.source, object);
        }
        if let Some(target) = &link.target
            && let Some(object) = target.object_id
        {
            owner.insert(target.id, object);
        }
    }

    let mut outcome = ChainOutcome::default();
    let mut created: HashMap<ObjectId, usize> = HashMap::new();

    for link in order {
        let object = if let Some(&object) = owner.get(&link.source) {
            object
        } else {
            let object = allocator.allocate();
            owner.insert(link.source, object);
            created.insert(object, outcome.objects.len());
            outcome.objects.push(LinkedObject {
                id: object,
                object_type,
                members: vec![link.source],
            });
            outcome.assignments.push(Assignment {
                segmentation: link.source,
                object,
            });
            if link.target.is_none() {
                debug!("no link found for {}", link.source);
            }
            object
        };

        let Some(target) = &link.target else {
            outcome.unlinked += 1;
            continue;
        };

        if let Some(&existing) = owner.get(&target.id) {
            warn!(
                "multiple links found for {}; keeping {existing}, skipping link from {}",
                target.id, link.source
            );
            outcome.rejections.push(Rejection {
                source: link.source,
                target: target.id,
                reason: RejectReason::AlreadyAssigned { object: existing },
            });
        } else if target.similarity < min_similarity {
            warn!(
                "skipping link {} -> {}: similarity {:.4} below threshold {min_similarity}",
                link.source, target.id, target.similarity
            );
            outcome.rejections.push(Rejection {
                source: link.source,
                target: target.id,
                reason: RejectReason::BelowThreshold {
                    similarity: target.similarity,
                    threshold: min_similarity,
                },
            });
        } else {
            owner.insert(target.id, object);
            if let Some(&slot) = created.get(&object) {
                outcome.objects[slot].members.push(target.id);
            }
            outcome.assignments.push(Assignment {
                segmentation: target.id,
                object,
            });
        }
    }
    outcome
}
