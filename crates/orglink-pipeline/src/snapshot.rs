//! Serialized form of a segmentation snapshot.
//!
//! The storage layer hands the pipeline a JSON document of segmentation
//! records. Transforms may be written either as a row-major 4x4 matrix or
//! as the 146-byte persisted payload (a JSON array of bytes). Decoding
//! validates both transforms and the contour of every record.

use serde::{Deserialize, Serialize};

use crate::affine::AffineTransform;
use crate::types::{
    Contour, ImageType, LinkingError, ObjectId, SegmentationId, SegmentationRecord,
};

/// A transform as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformRepr {
    /// Row-major 4x4 matrix.
    Matrix([[f64; 4]; 4]),
    /// Persisted binary payload.
    Encoded(Vec<u8>),
}

impl Default for TransformRepr {
    fn default() -> Self {
        Self::Matrix(*AffineTransform::IDENTITY.rows())
    }
}

impl TransformRepr {
    fn decode(&self, id: SegmentationId) -> Result<AffineTransform, LinkingError> {
        match self {
            Self::Matrix(rows) => Ok(AffineTransform::from_rows(*rows)),
            Self::Encoded(bytes) => AffineTransform::decode(bytes)
                .map_err(|source| LinkingError::TransformDecode { id, source }),
        }
    }
}

/// One segmentation record as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegmentationRecord {
    /// Stable identifier.
    pub id: SegmentationId,
    /// Owning object, if already assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    /// Well name.
    pub well: String,
    /// Fixation name.
    pub fixation: String,
    /// Fixation time-point.
    #[serde(default)]
    pub time_point: i64,
    /// Imaging round.
    pub round: i64,
    /// Z-stack plane index.
    #[serde(default)]
    pub z_index: i64,
    /// Upstream label.
    pub label: i64,
    /// Kind of source image.
    #[serde(default)]
    pub image_type: ImageType,
    /// Contour in segmentation-local coordinates.
    pub contour: Contour,
    /// Segmentation space to image space.
    #[serde(default)]
    pub seg_to_image: TransformRepr,
    /// Image space to microscope space.
    #[serde(default)]
    pub image_to_microscope: TransformRepr,
}

impl RawSegmentationRecord {
    /// Validate and convert into a [`SegmentationRecord`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkingError::TransformDecode`] for a malformed transform
    /// payload and [`LinkingError::InvalidContour`] for an unusable contour.
    pub fn decode(self) -> Result<SegmentationRecord, LinkingError> {
        let id = self.id;
        self.contour
            .validate()
            .map_err(|reason| LinkingError::InvalidContour { id, reason })?;
        Ok(SegmentationRecord {
            id,
            object_id: self.object_id,
            well: self.well,
            fixation: self.fixation,
            time_point: self.time_point,
            round: self.round,
            z_index: self.z_index,
            label: self.label,
            image_type: self.image_type,
            contour: self.contour,
            seg_to_image: self.seg_to_image.decode(id)?,
            image_to_microscope: self.image_to_microscope.decode(id)?,
        })
    }
}

impl From<&SegmentationRecord> for RawSegmentationRecord {
    fn from(record: &SegmentationRecord) -> Self {
        Self {
            id: record.id,
            object_id: record.object_id,
            well: record.well.clone(),
            fixation: record.fixation.clone(),
            time_point: record.time_point,
            round: record.round,
            z_index: record.z_index,
            label: record.label,
            image_type: record.image_type,
            contour: record.contour.clone(),
            seg_to_image: TransformRepr::Matrix(*record.seg_to_image.rows()),
            image_to_microscope: TransformRepr::Matrix(*record.image_to_microscope.rows()),
        }
    }
}

/// A full snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// All records, in storage order.
    pub records: Vec<RawSegmentationRecord>,
}

impl Snapshot {
    /// Validate and convert every record.
    ///
    /// # Errors
    ///
    /// Returns the first record error, see [`RawSegmentationRecord::decode`].
    pub fn decode(self) -> Result<Vec<SegmentationRecord>, LinkingError> {
        self.records
            .into_iter()
            .map(RawSegmentationRecord::decode)
            .collect()
    }
}
