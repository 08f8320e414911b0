//! Shared types for the orglink linking pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::affine::{AffineTransform, TransformDecodeError};

/// A 2D point in some coordinate frame (segmentation, image or microscope).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Manhattan (L1) distance to another point.
    #[must_use]
    pub fn manhattan_distance(self, other: Self) -> f64 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    /// Translate this point by a [`Shift`].
    #[must_use]
    pub fn shifted(self, shift: Shift) -> Self {
        Self::new(self.x + shift.dx, self.y + shift.dy)
    }
}

/// A 2D translation, used for stage drift between imaging rounds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Shift {
    /// Horizontal component.
    pub dx: f64,
    /// Vertical component.
    pub dy: f64,
}

impl Shift {
    /// The zero translation.
    pub const ZERO: Self = Self { dx: 0.0, dy: 0.0 };

    /// Create a new shift.
    #[must_use]
    pub const fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }
}

/// A closed polygon ring in segmentation-local coordinates.
///
/// The closing vertex may or may not be repeated; conversion to
/// `geo` closes the ring either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contour(Vec<Point>);

impl Contour {
    /// Create a contour from its ring vertices.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Axis-aligned rectangle `(min_x, min_y)`-`(max_x, max_y)` as a contour.
    #[must_use]
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self(vec![
            Point::new(min_x, min_y),
            Point::new(max_x, min_y),
            Point::new(max_x, max_y),
            Point::new(min_x, max_y),
            Point::new(min_x, min_y),
        ])
    }

    /// Returns a slice of all ring vertices.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Number of distinct vertices, ignoring a repeated closing vertex.
    #[must_use]
    pub fn distinct_vertex_count(&self) -> usize {
        let mut distinct: Vec<Point> = Vec::with_capacity(self.0.len());
        for p in &self.0 {
            if !distinct.contains(p) {
                distinct.push(*p);
            }
        }
        distinct.len()
    }

    /// Check that the ring is usable for linking.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the ring has fewer than three
    /// distinct vertices or contains non-finite coordinates.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.0.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(format!("non-finite vertex ({}, {})", p.x, p.y));
        }
        let distinct = self.distinct_vertex_count();
        if distinct < 3 {
            return Err(format!(
                "ring needs at least 3 distinct vertices, found {distinct}"
            ));
        }
        Ok(())
    }

    /// Convert to a `geo::Polygon` without holes.
    #[must_use]
    pub fn to_polygon(&self) -> geo::Polygon<f64> {
        let coords: Vec<geo::Coord<f64>> = self
            .0
            .iter()
            .map(|p| geo::Coord { x: p.x, y: p.y })
            .collect();
        geo::Polygon::new(geo::LineString::from(coords), Vec::new())
    }
}

/// Stable identifier of one segmentation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationId(pub u64);

impl fmt::Display for SegmentationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg#{}", self.0)
    }
}

/// Identifier of a persistent linked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Kind of biological object a chain of segmentations represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// Whole organoid, linked across imaging rounds.
    Organoid,
    /// Single cell, linked across z-stack planes.
    Cell,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Organoid => f.write_str("organoid"),
            Self::Cell => f.write_str("cell"),
        }
    }
}

/// Kind of image a segmentation was derived from.
///
/// Only segmentations of label images take part in linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// Label image produced by an upstream segmentation algorithm.
    #[default]
    Label,
    /// Raw intensity image.
    Intensity,
}

/// One observed instance of an object within one image channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRecord {
    /// Stable identifier.
    pub id: SegmentationId,
    /// Owning object, if already assigned.
    pub object_id: Option<ObjectId>,
    /// Well name (e.g. `A1`).
    pub well: String,
    /// Fixation name.
    pub fixation: String,
    /// Fixation time-point.
    pub time_point: i64,
    /// Imaging round.
    pub round: i64,
    /// Z-stack plane index within the round.
    pub z_index: i64,
    /// Opaque label from the upstream segmentation algorithm.
    pub label: i64,
    /// Kind of image the segmentation was derived from.
    pub image_type: ImageType,
    /// Contour in segmentation-local coordinates.
    pub contour: Contour,
    /// Segmentation space to image space.
    pub seg_to_image: AffineTransform,
    /// Image space to microscope space.
    pub image_to_microscope: AffineTransform,
}

impl SegmentationRecord {
    /// The composed segmentation-to-microscope transform.
    #[must_use]
    pub fn seg_to_microscope(&self) -> AffineTransform {
        self.image_to_microscope.compose(&self.seg_to_image)
    }
}

/// Errors that can occur while linking segmentations.
#[derive(Debug, thiserror::Error)]
pub enum LinkingError {
    /// A persisted transform payload could not be decoded.
    #[error("failed to decode transform of {id}: {source}")]
    TransformDecode {
        /// Segmentation whose transform is malformed.
        id: SegmentationId,
        /// Underlying decode failure.
        #[source]
        source: TransformDecodeError,
    },

    /// A contour is unusable (too few vertices, non-finite coordinates).
    #[error("invalid contour for {id}: {reason}")]
    InvalidContour {
        /// Segmentation whose contour is malformed.
        id: SegmentationId,
        /// What is wrong with it.
        reason: String,
    },

    /// Linking configuration is invalid.
    #[error("invalid linking configuration: {0}")]
    InvalidConfig(String),

    /// The write sink refused a partition.
    #[error("failed to commit partition {partition}: {reason}")]
    Sink {
        /// Display form of the partition key.
        partition: String,
        /// Sink-provided failure description.
        reason: String,
    },
}
