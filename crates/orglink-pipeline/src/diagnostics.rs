//! Linking diagnostics: timing and counts for each stage of each partition.
//!
//! Every call to [`link_partition`](crate::link_partition) collects these
//! alongside its decisions. They are meant for tuning thresholds and
//! spotting partitions where drift estimation or matching went wrong.
//!
//! The library never reads a clock itself. Callers supply a [`Clock`];
//! [`NoClock`] records zero durations.
//!
//! Durations are serialized as fractional seconds (`f64`) since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{LinkingMode, Stage};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of stage timestamps.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// Current timestamp.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// A [`Clock`] that measures nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClock;

impl Clock for NoClock {
    type Instant = ();

    fn now(&self) {}

    fn elapsed(&self, _since: &()) -> Duration {
        Duration::ZERO
    }
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Candidate pair discovery.
    FindCandidates {
        /// Segmentations in the partition.
        segmentations: usize,
        /// Distinct positions along the linked dimension.
        groups: usize,
        /// Pairs with a target.
        candidate_pairs: usize,
        /// Sources without any candidate.
        unpaired_sources: usize,
    },
    /// Drift estimation.
    EstimateShifts {
        /// Reference round.
        reference_round: Option<i64>,
        /// Rounds with an estimate, reference included.
        rounds_with_shift: usize,
        /// Rounds left without an estimate.
        rounds_without_shift: usize,
        /// Samples taken over all rounds.
        samples: usize,
    },
    /// Similarity scoring.
    Score {
        /// Pairs that were scored.
        scored: usize,
        /// Pairs dropped for a missing shift.
        missing_shift: usize,
        /// Pairs dropped at the distance cutoff.
        beyond_cutoff: usize,
        /// Pairs dropped for degenerate geometry.
        degenerate: usize,
    },
    /// Mutual-best-match reduction.
    SelectMutualBest {
        /// Rows still carrying a target.
        links: usize,
        /// Sources demoted to unlinked.
        demoted: usize,
    },
    /// Chain construction.
    BuildChains {
        /// Objects created.
        objects_created: usize,
        /// New segmentation assignments.
        assignments: usize,
        /// Links rejected because the target was already owned.
        rejected_conflict: usize,
        /// Links rejected below the similarity threshold.
        rejected_threshold: usize,
    },
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage ran.
    pub stage: Stage,
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Diagnostics for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDiagnostics {
    /// Display form of the partition key.
    pub partition: String,
    /// Linking mode.
    pub mode: LinkingMode,
    /// Stages in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl PartitionDiagnostics {
    /// Metrics recorded for `stage`, if it ran.
    #[must_use]
    pub fn metrics(&self, stage: Stage) -> Option<&StageMetrics> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.metrics)
    }

    /// Human-readable per-stage breakdown.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!(
            "Partition {} ({} linking)\n{}",
            self.partition,
            self.mode,
            "=".repeat(60)
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration)
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let name = diag.stage.name();
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.join("\n")
    }
}

/// Totals over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Partitions processed.
    pub partitions: usize,
    /// Segmentations taking part in linking.
    pub segmentations: usize,
    /// Objects created.
    pub objects_created: usize,
    /// New segmentation assignments.
    pub assignments: usize,
    /// Rejected links.
    pub rejections: usize,
    /// Per-partition diagnostics in partition order.
    pub diagnostics: Vec<PartitionDiagnostics>,
}

impl RunSummary {
    /// Report of every partition followed by the run totals.
    #[must_use]
    pub fn report(&self) -> String {
        let mut sections: Vec<String> = self
            .diagnostics
            .iter()
            .map(PartitionDiagnostics::report)
            .collect();
        sections.push(format!(
            "Run summary\n{}\nPartitions: {}  |  Segmentations: {}  |  Objects created: {}  |  Assignments: {}  |  Rejected links: {}",
            "=".repeat(60),
            self.partitions,
            self.segmentations,
            self.objects_created,
            self.assignments,
            self.rejections,
        ));
        sections.join("\n\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::FindCandidates {
            segmentations,
            groups,
            candidate_pairs,
            unpaired_sources,
        } => format!(
            "{segmentations} segs in {groups} groups -> {candidate_pairs} pairs ({unpaired_sources} unpaired)"
        ),
        StageMetrics::EstimateShifts {
            reference_round,
            rounds_with_shift,
            rounds_without_shift,
            samples,
        } => {
            let reference = reference_round.map_or_else(|| "-".to_string(), |r| r.to_string());
            format!(
                "ref={reference} shifted={rounds_with_shift} missing={rounds_without_shift} samples={samples}"
            )
        }
        StageMetrics::Score {
            scored,
            missing_shift,
            beyond_cutoff,
            degenerate,
        } => format!(
            "scored={scored} excluded: shift={missing_shift} cutoff={beyond_cutoff} degenerate={degenerate}"
        ),
        StageMetrics::SelectMutualBest { links, demoted } => {
            format!("{links} links, {demoted} demoted")
        }
        StageMetrics::BuildChains {
            objects_created,
            assignments,
            rejected_conflict,
            rejected_threshold,
        } => format!(
            "{objects_created} objects, {assignments} assignments, rejected: conflict={rejected_conflict} threshold={rejected_threshold}"
        ),
    }
}
