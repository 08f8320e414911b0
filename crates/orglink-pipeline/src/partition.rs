//! Grouping of a flat segmentation snapshot into independent partitions.
//!
//! Round linking partitions by well x fixation x time-point; stack linking
//! additionally by round. No state crosses a partition boundary.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::pipeline::LinkingMode;
use crate::projection::{ProjectedSegmentation, ProjectionCache};
use crate::types::{ImageType, ObjectId, SegmentationId, SegmentationRecord};

/// Identifies one partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Well name.
    pub well: String,
    /// Fixation name.
    pub fixation: String,
    /// Fixation time-point.
    pub time_point: i64,
    /// Imaging round; only set for stack linking.
    pub round: Option<i64>,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "well={} fixation={} t={}",
            self.well, self.fixation, self.time_point
        )?;
        if let Some(round) = self.round {
            write!(f, " round={round}")?;
        }
        Ok(())
    }
}

/// The label-image segmentations of one partition, sorted by id.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Partition identity.
    pub key: PartitionKey,
    /// Member segmentations.
    pub records: Vec<SegmentationRecord>,
}

/// Split `records` into partitions for `mode`.
///
/// Only label-image segmentations are kept. Partitions come back in key
/// order with records sorted by id, so downstream processing is
/// deterministic regardless of snapshot order. A repeated id within a
/// partition keeps its first occurrence.
#[must_use]
pub fn partition_records(records: Vec<SegmentationRecord>, mode: LinkingMode) -> Vec<Partition> {
    let total = records.len();
    let mut groups: BTreeMap<PartitionKey, Vec<SegmentationRecord>> = BTreeMap::new();

    for record in records {
        if record.image_type != ImageType::Label {
            continue;
        }
        let key = PartitionKey {
            well: record.well.clone(),
            fixation: record.fixation.clone(),
            time_point: record.time_point,
            round: match mode {
                LinkingMode::Rounds => None,
                LinkingMode::Stack => Some(record.round),
            },
        };
        groups.entry(key).or_default().push(record);
    }

    let partitions: Vec<Partition> = groups
        .into_iter()
        .map(|(key, mut records)| {
            records.sort_by_key(|r| r.id);
            let before = records.len();
            records.dedup_by_key(|r| r.id);
            if records.len() != before {
                warn!(
                    "partition {key}: dropped {} duplicate segmentation ids",
                    before - records.len()
                );
            }
            Partition { key, records }
        })
        .collect();

    debug!(
        "split {total} segmentations into {} {mode} partitions",
        partitions.len()
    );
    partitions
}

/// One segmentation as seen by the linking stages.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEntry<'a> {
    /// Segmentation id.
    pub id: SegmentationId,
    /// Upstream label.
    pub label: i64,
    /// Position along the linked dimension (round or z-index).
    pub position: i64,
    /// Object assigned before this run, if any.
    pub object_id: Option<ObjectId>,
    /// Derived geometry.
    pub geometry: &'a ProjectedSegmentation,
}

/// Build stage entries for `records`, projecting each one through `cache`.
///
/// Entries keep the order of `records`.
pub fn build_entries<'a>(
    records: &[SegmentationRecord],
    mode: LinkingMode,
    cache: &'a mut ProjectionCache,
) -> Vec<PartitionEntry<'a>> {
    for record in records {
        cache.get_or_project(record);
    }
    let cache: &'a ProjectionCache = cache;
    records
        .iter()
        .filter_map(|record| {
            cache.get(record.id).map(|geometry| PartitionEntry {
                id: record.id,
                label: record.label,
                position: mode.position(record),
                object_id: record.object_id,
                geometry,
            })
        })
        .collect()
}
