//! Affine transforms in homogeneous 4x4 form and their persisted binary codec.
//!
//! The binary layout matches the matrix blobs stored by the spatial
//! database extension, so payloads written here can be read there and
//! vice versa:
//!
//! ```text
//! offset  size  content
//! 0       1     magic start (0x00)
//! 1       1     little-endian flag (0x01)
//! 2       9*16  16 x (f64 little-endian, delimiter 0x3A), row-major;
//!               the very last delimiter is the magic end (0xB3)
//! ```
//!
//! Only the little-endian flavour is produced and accepted.

use geo::AffineOps;
use serde::{Deserialize, Serialize};

use crate::types::Point;

/// Size of an encoded transform in bytes.
pub const ENCODED_LEN: usize = 2 + 16 * 9;

const MAGIC_START: u8 = 0x00;
const MAGIC_DELIMITER: u8 = 0x3A;
const MAGIC_END: u8 = 0xB3;
const LITTLE_ENDIAN_FLAG: u8 = 0x01;

/// Errors produced when decoding a persisted transform payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformDecodeError {
    /// Payload is not exactly [`ENCODED_LEN`] bytes long.
    #[error("expected {ENCODED_LEN} bytes, found {0}")]
    Length(usize),

    /// First byte is not the start marker.
    #[error("unexpected start marker 0x{0:02X}")]
    MagicStart(u8),

    /// Last byte is not the end marker.
    #[error("unexpected end marker 0x{0:02X}")]
    MagicEnd(u8),

    /// Endianness flag is not `true`.
    #[error("unsupported endianness flag 0x{0:02X}")]
    Endianness(u8),

    /// A delimiter between two entries is not `0x3A`.
    #[error("unexpected delimiter 0x{found:02X} after entry {entry}")]
    Delimiter {
        /// Zero-based row-major entry preceding the delimiter.
        entry: usize,
        /// Byte found in place of the delimiter.
        found: u8,
    },
}

/// An affine map in homogeneous coordinates.
///
/// Stored row-major. The bottom row is conventionally `[0, 0, 0, 1]`
/// but arbitrary values are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffineTransform([[f64; 4]; 4]);

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AffineTransform {
    /// The identity map.
    pub const IDENTITY: Self = Self([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// Create a transform from its rows.
    #[must_use]
    pub const fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self(rows)
    }

    /// A planar translation by `(dx, dy)`.
    #[must_use]
    pub const fn translation(dx: f64, dy: f64) -> Self {
        let mut rows = Self::IDENTITY.0;
        rows[0][3] = dx;
        rows[1][3] = dy;
        Self(rows)
    }

    /// A planar scale by `(sx, sy)`.
    #[must_use]
    pub const fn scale(sx: f64, sy: f64) -> Self {
        let mut rows = Self::IDENTITY.0;
        rows[0][0] = sx;
        rows[1][1] = sy;
        Self(rows)
    }

    /// The matrix rows.
    #[must_use]
    pub const fn rows(&self) -> &[[f64; 4]; 4] {
        &self.0
    }

    /// Matrix product `self · other`: `other` is applied first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut out = [[0.0; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.0[i][k] * other.0[k][j]).sum();
            }
        }
        Self(out)
    }

    /// The 3x3 planar projection `[xx xy xoff; yx yy yoff; w1 w2 w4]`.
    #[must_use]
    pub const fn planar(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[0][0], m[0][1], m[0][3]],
            [m[1][0], m[1][1], m[1][3]],
            [m[3][0], m[3][1], m[3][3]],
        ]
    }

    /// The 2D affine sub-block as a `geo` transform.
    #[must_use]
    pub fn to_geo(&self) -> geo::AffineTransform<f64> {
        let m = &self.0;
        geo::AffineTransform::new(m[0][0], m[0][1], m[0][3], m[1][0], m[1][1], m[1][3])
    }

    /// Map a single point through the 2D affine sub-block.
    ///
    /// Rounds exactly like [`apply`](Self::apply).
    #[must_use]
    #[allow(clippy::suboptimal_flops)]
    pub fn apply_point(&self, p: Point) -> Point {
        let m = &self.0;
        Point::new(
            m[0][0] * p.x + m[0][1] * p.y + m[0][3],
            m[1][0] * p.x + m[1][1] * p.y + m[1][3],
        )
    }

    /// Map every vertex of a polygon, preserving vertex order and closure.
    #[must_use]
    pub fn apply(&self, polygon: &geo::Polygon<f64>) -> geo::Polygon<f64> {
        polygon.affine_transform(&self.to_geo())
    }

    /// Encode into the persisted little-endian layout.
    #[must_use]
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[0] = MAGIC_START;
        out[1] = LITTLE_ENDIAN_FLAG;
        for (entry, value) in self.0.iter().flatten().enumerate() {
            let offset = 2 + entry * 9;
            out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            out[offset + 8] = MAGIC_DELIMITER;
        }
        out[ENCODED_LEN - 1] = MAGIC_END;
        out
    }

    /// Decode from the persisted little-endian layout.
    ///
    /// # Errors
    ///
    /// Returns a [`TransformDecodeError`] for payloads of the wrong length,
    /// with wrong start/end markers or delimiters, or with an endianness
    /// flag other than `true`. Malformed payloads are never repaired.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransformDecodeError> {
        if bytes.len() != ENCODED_LEN {
            return Err(TransformDecodeError::Length(bytes.len()));
        }
        if bytes[0] != MAGIC_START {
            return Err(TransformDecodeError::MagicStart(bytes[0]));
        }
        if bytes[ENCODED_LEN - 1] != MAGIC_END {
            return Err(TransformDecodeError::MagicEnd(bytes[ENCODED_LEN - 1]));
        }
        if bytes[1] != LITTLE_ENDIAN_FLAG {
            return Err(TransformDecodeError::Endianness(bytes[1]));
        }

        let mut rows = [[0.0; 4]; 4];
        for (entry, value) in rows.iter_mut().flatten().enumerate() {
            let offset = 2 + entry * 9;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            *value = f64::from_le_bytes(raw);

            let delimiter = bytes[offset + 8];
            if entry < 15 && delimiter != MAGIC_DELIMITER {
                return Err(TransformDecodeError::Delimiter {
                    entry,
                    found: delimiter,
                });
            }
        }
        Ok(Self(rows))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::{Coord, LineString, Polygon};

    use super::*;

    fn sample() -> AffineTransform {
        AffineTransform::from_rows([
            [1.5, -0.25, 0.0, 12.0],
            [0.25, 1.5, 0.0, -7.5],
            [0.0, 0.0, 1.0, 0.0],
            [0.1, 0.2, 0.3, 0.9],
        ])
    }

    fn bits(t: &AffineTransform) -> Vec<u64> {
        t.rows().iter().flatten().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn encoded_length_is_146() {
        assert_eq!(ENCODED_LEN, 146);
        assert_eq!(sample().encode().len(), 146);
    }

    #[test]
    fn encode_layout_matches_persisted_format() {
        let bytes = AffineTransform::IDENTITY.encode();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..10], &1.0f64.to_le_bytes());
        assert_eq!(bytes[10], 0x3A);
        assert_eq!(&bytes[11..19], &0.0f64.to_le_bytes());
        for entry in 0..15 {
            assert_eq!(bytes[2 + entry * 9 + 8], 0x3A, "delimiter after {entry}");
        }
        assert_eq!(bytes[145], 0xB3);
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let extremes = AffineTransform::from_rows([
            [f64::MAX, f64::MIN_POSITIVE, -0.0, 1e-300],
            [-1e300, 0.1 + 0.2, std::f64::consts::PI, -1.0],
            [f64::EPSILON, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, f64::MIN],
        ]);
        for t in [AffineTransform::IDENTITY, sample(), extremes] {
            let decoded = AffineTransform::decode(&t.encode()).unwrap();
            assert_eq!(bits(&decoded), bits(&t));
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let bytes = sample().encode();
        assert_eq!(
            AffineTransform::decode(&bytes[..145]),
            Err(TransformDecodeError::Length(145))
        );
        let mut longer = bytes.to_vec();
        longer.push(0xB3);
        assert_eq!(
            AffineTransform::decode(&longer),
            Err(TransformDecodeError::Length(147))
        );
        assert_eq!(
            AffineTransform::decode(&[]),
            Err(TransformDecodeError::Length(0))
        );
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = 0x01;
        assert_eq!(
            AffineTransform::decode(&bytes),
            Err(TransformDecodeError::MagicStart(0x01))
        );

        let mut bytes = sample().encode();
        bytes[145] = 0x3A;
        assert_eq!(
            AffineTransform::decode(&bytes),
            Err(TransformDecodeError::MagicEnd(0x3A))
        );
    }

    #[test]
    fn decode_rejects_big_endian_flag() {
        for flag in [0x00, 0x02, 0xFF] {
            let mut bytes = sample().encode();
            bytes[1] = flag;
            assert_eq!(
                AffineTransform::decode(&bytes),
                Err(TransformDecodeError::Endianness(flag))
            );
        }
    }

    #[test]
    fn decode_rejects_bad_delimiter() {
        let mut bytes = sample().encode();
        bytes[2 + 4 * 9 + 8] = 0x00;
        assert_eq!(
            AffineTransform::decode(&bytes),
            Err(TransformDecodeError::Delimiter {
                entry: 4,
                found: 0x00
            })
        );
    }

    #[test]
    fn compose_is_associative() {
        let a = sample();
        let b = AffineTransform::translation(3.0, -4.0);
        let c = AffineTransform::scale(2.0, 0.5);
        let left = a.compose(&b).compose(&c);
        let right = a.compose(&b.compose(&c));
        for (l, r) in left.rows().iter().flatten().zip(right.rows().iter().flatten()) {
            assert!((l - r).abs() < 1e-9, "{l} != {r}");
        }
    }

    #[test]
    fn compose_is_not_commutative() {
        let a = AffineTransform::translation(10.0, 0.0);
        let b = AffineTransform::scale(2.0, 2.0);
        assert_ne!(a.compose(&b), b.compose(&a));

        // a·b scales first, then translates.
        let p = a.compose(&b).apply_point(Point::new(1.0, 1.0));
        assert_eq!(p, Point::new(12.0, 2.0));
        let q = b.compose(&a).apply_point(Point::new(1.0, 1.0));
        assert_eq!(q, Point::new(22.0, 2.0));
    }

    #[test]
    fn compose_with_identity_is_noop() {
        let t = sample();
        assert_eq!(t.compose(&AffineTransform::IDENTITY), t);
        assert_eq!(AffineTransform::IDENTITY.compose(&t), t);
    }

    #[test]
    fn apply_preserves_order_and_closure() {
        let polygon = Polygon::new(
            LineString::from(vec![
                Coord { x: 0.0, y: 0.0 },
                Coord { x: 2.0, y: 0.0 },
                Coord { x: 2.0, y: 1.0 },
            ]),
            Vec::new(),
        );
        let moved = AffineTransform::translation(1.0, 2.0).apply(&polygon);
        let coords: Vec<Coord<f64>> = moved.exterior().coords().copied().collect();
        assert_eq!(
            coords,
            vec![
                Coord { x: 1.0, y: 2.0 },
                Coord { x: 3.0, y: 2.0 },
                Coord { x: 3.0, y: 3.0 },
                Coord { x: 1.0, y: 2.0 },
            ]
        );
    }

    #[test]
    fn apply_point_agrees_with_apply_to_the_bit() {
        let t = AffineTransform::from_rows([
            [0.1, 0.7, 0.0, 1e-3],
            [-0.3, 1.1, 0.0, 123.456],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let points = [(0.3, 0.6), (1e8, -3.3), (-7.77, 0.01)];
        let polygon = Polygon::new(
            LineString::from(
                points
                    .iter()
                    .map(|&(x, y)| Coord { x, y })
                    .collect::<Vec<_>>(),
            ),
            Vec::new(),
        );
        let moved = t.apply(&polygon);
        for (&(x, y), c) in points.iter().zip(moved.exterior().coords()) {
            let p = t.apply_point(Point::new(x, y));
            assert_eq!(p.x.to_bits(), c.x.to_bits());
            assert_eq!(p.y.to_bits(), c.y.to_bits());
        }
    }

    #[test]
    fn apply_ignores_z_column() {
        let t = AffineTransform::from_rows([
            [1.0, 0.0, 99.0, 5.0],
            [0.0, 1.0, 99.0, 6.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert_eq!(t.apply_point(Point::new(1.0, 1.0)), Point::new(6.0, 7.0));
    }

    #[test]
    fn planar_projection_drops_z() {
        let p = sample().planar();
        assert_eq!(p, [[1.5, -0.25, 12.0], [0.25, 1.5, -7.5], [0.1, 0.2, 0.9]]);
    }

    #[test]
    fn serde_round_trip() {
        let t = sample();
        let json = serde_json::to_string(&t).unwrap();
        let back: AffineTransform = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
