//! Linking parameters.
//!
//! All constants were chosen empirically on organoid screens and are
//! configuration, not invariants.

use serde::{Deserialize, Serialize};

use crate::types::LinkingError;

/// Parameters for linking organoids across imaging rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundLinkingConfig {
    /// Margin added on every side of a microscope-space bounding box
    /// before testing two segmentations for candidacy.
    pub bbox_margin: f64,

    /// Upper bound on the number of reference-round segmentations sampled
    /// when estimating the drift of another round.
    pub max_shift_samples: usize,

    /// Fraction of sorted shift samples dropped at the low end.
    pub trim_low: f64,

    /// Fraction of sorted shift samples kept up to (exclusive) at the high end.
    pub trim_high: f64,

    /// Decay rate of the `exp(-decay * manhattan)` distance penalty.
    pub distance_decay: f64,

    /// Pairs whose shift-corrected Manhattan distance reaches this value
    /// are never scored.
    pub max_distance: f64,

    /// Links scoring below this similarity are rejected.
    pub min_similarity: f64,
}

impl RoundLinkingConfig {
    /// Default bounding-box margin.
    pub const DEFAULT_BBOX_MARGIN: f64 = 100.0;
    /// Default shift sample limit.
    pub const DEFAULT_MAX_SHIFT_SAMPLES: usize = 100;
    /// Default lower trim fraction.
    pub const DEFAULT_TRIM_LOW: f64 = 0.2;
    /// Default upper trim fraction.
    pub const DEFAULT_TRIM_HIGH: f64 = 0.8;
    /// Default distance decay.
    pub const DEFAULT_DISTANCE_DECAY: f64 = 0.001;
    /// Default hard distance cutoff.
    pub const DEFAULT_MAX_DISTANCE: f64 = 200.0;
    /// Default similarity threshold.
    pub const DEFAULT_MIN_SIMILARITY: f64 = 0.6;
}

impl Default for RoundLinkingConfig {
    fn default() -> Self {
        Self {
            bbox_margin: Self::DEFAULT_BBOX_MARGIN,
            max_shift_samples: Self::DEFAULT_MAX_SHIFT_SAMPLES,
            trim_low: Self::DEFAULT_TRIM_LOW,
            trim_high: Self::DEFAULT_TRIM_HIGH,
            distance_decay: Self::DEFAULT_DISTANCE_DECAY,
            max_distance: Self::DEFAULT_MAX_DISTANCE,
            min_similarity: Self::DEFAULT_MIN_SIMILARITY,
        }
    }
}

/// Parameters for linking cells across z-stack planes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackLinkingConfig {
    /// Margin added on every side of a microscope-space bounding box
    /// before testing two segmentations for candidacy.
    pub bbox_margin: f64,

    /// Largest z-index gap a link may bridge.
    pub max_z_gap: i64,

    /// Decay rate of the `exp(-decay * euclidean)` distance penalty.
    pub distance_decay: f64,

    /// Links scoring below this similarity are rejected.
    pub min_similarity: f64,
}

impl StackLinkingConfig {
    /// Default bounding-box margin.
    pub const DEFAULT_BBOX_MARGIN: f64 = 100.0;
    /// Default maximum z gap.
    pub const DEFAULT_MAX_Z_GAP: i64 = 3;
    /// Default distance decay.
    pub const DEFAULT_DISTANCE_DECAY: f64 = 0.05;
    /// Default similarity threshold.
    pub const DEFAULT_MIN_SIMILARITY: f64 = 0.75;
}

impl Default for StackLinkingConfig {
    fn default() -> Self {
        Self {
            bbox_margin: Self::DEFAULT_BBOX_MARGIN,
            max_z_gap: Self::DEFAULT_MAX_Z_GAP,
            distance_decay: Self::DEFAULT_DISTANCE_DECAY,
            min_similarity: Self::DEFAULT_MIN_SIMILARITY,
        }
    }
}

/// Configuration for both linking modes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Organoid linking across rounds.
    pub rounds: RoundLinkingConfig,
    /// Cell linking across z-stack planes.
    pub stack: StackLinkingConfig,
}

impl LinkingConfig {
    /// Check every parameter for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`LinkingError::InvalidConfig`] naming the first offending
    /// parameter.
    pub fn validate(&self) -> Result<(), LinkingError> {
        let r = &self.rounds;
        let s = &self.stack;

        check_non_negative("rounds.bbox_margin", r.bbox_margin)?;
        check_non_negative("stack.bbox_margin", s.bbox_margin)?;
        check_non_negative("rounds.distance_decay", r.distance_decay)?;
        check_non_negative("stack.distance_decay", s.distance_decay)?;
        check_similarity("rounds.min_similarity", r.min_similarity)?;
        check_similarity("stack.min_similarity", s.min_similarity)?;

        if r.max_shift_samples == 0 {
            return Err(invalid("rounds.max_shift_samples must be at least 1"));
        }
        if !(0.0..1.0).contains(&r.trim_low)
            || !(r.trim_high > r.trim_low && r.trim_high <= 1.0)
        {
            return Err(invalid(&format!(
                "rounds trim window [{}, {}) must satisfy 0 <= low < high <= 1",
                r.trim_low, r.trim_high
            )));
        }
        if !(r.max_distance.is_finite() && r.max_distance > 0.0) {
            return Err(invalid(&format!(
                "rounds.max_distance must be positive and finite, got {}",
                r.max_distance
            )));
        }
        if s.max_z_gap < 1 {
            return Err(invalid(&format!(
                "stack.max_z_gap must be at least 1, got {}",
                s.max_z_gap
            )));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> LinkingError {
    LinkingError::InvalidConfig(msg.to_string())
}

fn check_non_negative(name: &str, value: f64) -> Result<(), LinkingError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(&format!(
            "{name} must be non-negative and finite, got {value}"
        )))
    }
}

fn check_similarity(name: &str, value: f64) -> Result<(), LinkingError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(&format!("{name} must lie in [0, 1], got {value}")))
    }
}
