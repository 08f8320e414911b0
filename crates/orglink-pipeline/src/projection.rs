//! Coordinate projection of segmentation contours.
//!
//! A contour lives in its own segmentation frame. Two chained transforms
//! take it to the shared microscope frame:
//!
//! ```text
//! segmentation --seg_to_image--> image --image_to_microscope--> microscope
//! ```
//!
//! Linking needs the same derived geometry (microscope centroid and
//! envelope, healed segmentation-space shape) many times per partition,
//! so [`ProjectionCache`] computes it once per segmentation id.

use std::collections::HashMap;

use geo::{Area, BooleanOps, BoundingRect, Centroid, MultiPolygon, Polygon, Rect};

use crate::types::{Point, SegmentationId, SegmentationRecord};

/// Coordinate frame a contour can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Segmentation-local frame (no transform applied).
    Segmentation,
    /// Frame of the image the segmentation was derived from.
    Image,
    /// Shared physical frame for cross-round comparison.
    Microscope,
}

/// Contour of `record` expressed in `space`.
#[must_use]
pub fn contour_in(record: &SegmentationRecord, space: Space) -> Polygon<f64> {
    let local = record.contour.to_polygon();
    match space {
        Space::Segmentation => local,
        Space::Image => record.seg_to_image.apply(&local),
        Space::Microscope => record
            .image_to_microscope
            .apply(&record.seg_to_image.apply(&local)),
    }
}

/// Bounding box of `record`'s contour in `space`.
///
/// `None` for an empty contour or one with non-finite vertices.
#[must_use]
pub fn envelope_in(record: &SegmentationRecord, space: Space) -> Option<Rect<f64>> {
    envelope_of(&contour_in(record, space))
}

/// Centroid of `record`'s contour in `space`.
///
/// `None` for an empty contour or one with non-finite vertices.
#[must_use]
pub fn centroid_in(record: &SegmentationRecord, space: Space) -> Option<Point> {
    centroid_of(&contour_in(record, space))
}

/// Whether every exterior vertex has finite coordinates. `geo` algorithms
/// assume they do.
fn is_finite(polygon: &Polygon<f64>) -> bool {
    polygon
        .exterior()
        .coords()
        .all(|c| c.x.is_finite() && c.y.is_finite())
}

fn centroid_of(polygon: &Polygon<f64>) -> Option<Point> {
    if !is_finite(polygon) {
        return None;
    }
    polygon.centroid().map(|c| Point::new(c.x(), c.y()))
}

fn envelope_of(polygon: &Polygon<f64>) -> Option<Rect<f64>> {
    if !is_finite(polygon) {
        return None;
    }
    polygon.bounding_rect()
}

/// Clean up self-intersections by resolving the ring against itself.
///
/// Plays the role of a zero-width buffer: overlapping lobes are merged
/// and bow-ties split into valid parts.
#[must_use]
pub fn heal(polygon: &Polygon<f64>) -> MultiPolygon<f64> {
    polygon.union(polygon)
}

/// Derived geometry of one segmentation, computed once per partition.
#[derive(Debug, Clone)]
pub struct ProjectedSegmentation {
    /// Segmentation this geometry belongs to.
    pub id: SegmentationId,
    /// Healed contour in segmentation space, used for overlap scoring.
    /// Empty when the contour encloses no area.
    pub healed: MultiPolygon<f64>,
    /// Microscope-space centroid, `None` when degenerate.
    pub centroid: Option<Point>,
    /// Microscope-space bounding box, `None` when degenerate.
    pub envelope: Option<Rect<f64>>,
}

impl ProjectedSegmentation {
    /// Project `record` into every frame linking needs.
    #[must_use]
    pub fn new(record: &SegmentationRecord) -> Self {
        let local = record.contour.to_polygon();
        let microscope = record.seg_to_microscope().apply(&local);
        let area = local.unsigned_area();
        let healed = if is_finite(&local) && area.is_finite() && area > 0.0 {
            heal(&local)
        } else {
            MultiPolygon::new(Vec::new())
        };
        Self {
            id: record.id,
            healed,
            centroid: centroid_of(&microscope),
            envelope: envelope_of(&microscope),
        }
    }

    /// Microscope-space envelope grown by `margin` on every side.
    #[must_use]
    pub fn expanded_envelope(&self, margin: f64) -> Option<Rect<f64>> {
        self.envelope.map(|r| {
            let min = r.min();
            let max = r.max();
            Rect::new(
                geo::Coord {
                    x: min.x - margin,
                    y: min.y - margin,
                },
                geo::Coord {
                    x: max.x + margin,
                    y: max.y + margin,
                },
            )
        })
    }
}

/// Per-partition memo of [`ProjectedSegmentation`] keyed by segmentation id.
#[derive(Debug, Default)]
pub struct ProjectionCache {
    entries: HashMap<SegmentationId, ProjectedSegmentation>,
}

impl ProjectionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Geometry for `record`, projecting it on first use.
    pub fn get_or_project(&mut self, record: &SegmentationRecord) -> &ProjectedSegmentation {
        self.entries
            .entry(record.id)
            .or_insert_with(|| ProjectedSegmentation::new(record))
    }

    /// Geometry previously projected for `id`.
    #[must_use]
    pub fn get(&self, id: SegmentationId) -> Option<&ProjectedSegmentation> {
        self.entries.get(&id)
    }

    /// Number of projected segmentations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been projected yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
