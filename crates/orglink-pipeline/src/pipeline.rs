//! Stage driver for linking one partition, and for a whole snapshot.
//!
//! A linking mode is a fixed list of [`Stage`]s. [`link_partition`] walks
//! that list once, threading a per-partition state through every stage and
//! recording diagnostics as it goes. [`link_all`] fans partitions out over
//! a rayon pool and commits each finished one to a [`LinkSink`].

use std::collections::BTreeSet;
use std::fmt;

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::candidates::{CandidatePair, find_candidates};
use crate::chain::{
    Assignment, ChainOutcome, LinkedObject, ObjectIdAllocator, RejectReason, Rejection,
    build_chains,
};
use crate::config::LinkingConfig;
use crate::diagnostics::{
    Clock, PartitionDiagnostics, RunSummary, StageDiagnostics, StageMetrics,
};
use crate::matching::select_mutual_best;
use crate::partition::{Partition, PartitionEntry, PartitionKey, build_entries, partition_records};
use crate::projection::ProjectionCache;
use crate::shift::{ShiftTable, estimate_shifts};
use crate::similarity::{CandidateLink, Scorer, score_candidates};
use crate::sink::LinkSink;
use crate::types::{LinkingError, ObjectType, SegmentationRecord};

/// What is being linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkingMode {
    /// Organoids across imaging rounds of the same well.
    Rounds,
    /// Cells across z-stack planes of the same round.
    Stack,
}

impl LinkingMode {
    /// Position of `record` along the linked dimension.
    #[must_use]
    pub const fn position(self, record: &SegmentationRecord) -> i64 {
        match self {
            Self::Rounds => record.round,
            Self::Stack => record.z_index,
        }
    }

    /// Type of the objects this mode creates.
    #[must_use]
    pub const fn object_type(self) -> ObjectType {
        match self {
            Self::Rounds => ObjectType::Organoid,
            Self::Stack => ObjectType::Cell,
        }
    }

    /// Stages this mode runs, in order.
    #[must_use]
    pub const fn stages(self) -> &'static [Stage] {
        match self {
            Self::Rounds => &[
                Stage::FindCandidates,
                Stage::EstimateShifts,
                Stage::Score,
                Stage::SelectMutualBest,
                Stage::BuildChains,
            ],
            Self::Stack => &[
                Stage::FindCandidates,
                Stage::Score,
                Stage::SelectMutualBest,
                Stage::BuildChains,
            ],
        }
    }

    /// Similarity threshold for accepting a link.
    #[must_use]
    pub const fn min_similarity(self, config: &LinkingConfig) -> f64 {
        match self {
            Self::Rounds => config.rounds.min_similarity,
            Self::Stack => config.stack.min_similarity,
        }
    }

    const fn bbox_margin(self, config: &LinkingConfig) -> f64 {
        match self {
            Self::Rounds => config.rounds.bbox_margin,
            Self::Stack => config.stack.bbox_margin,
        }
    }

    const fn max_gap(self, config: &LinkingConfig) -> Option<i64> {
        match self {
            Self::Rounds => None,
            Self::Stack => Some(config.stack.max_z_gap),
        }
    }
}

impl fmt::Display for LinkingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rounds => f.write_str("rounds"),
            Self::Stack => f.write_str("stack"),
        }
    }
}

/// One step of the linking pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Spatial join into candidate pairs.
    FindCandidates,
    /// Drift estimation against the reference round.
    EstimateShifts,
    /// Similarity scoring of candidate pairs.
    Score,
    /// Mutual-best-match reduction.
    SelectMutualBest,
    /// Object chain construction.
    BuildChains,
}

impl Stage {
    /// Display name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FindCandidates => "Find Candidates",
            Self::EstimateShifts => "Estimate Shifts",
            Self::Score => "Score",
            Self::SelectMutualBest => "Select Mutual Best",
            Self::BuildChains => "Build Chains",
        }
    }
}

/// How [`link_all`] schedules partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    /// Partitions run concurrently on the rayon pool. Memberships are
    /// deterministic; object id values depend on scheduling.
    #[default]
    Parallel,
    /// Partitions run one after another in key order, so object ids are
    /// reproducible too.
    Sequential,
}

/// Decisions for one partition, ready for a [`LinkSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionOutcome {
    /// Partition identity.
    pub key: PartitionKey,
    /// Linking mode that produced these decisions.
    pub mode: LinkingMode,
    /// Segmentations that took part.
    pub segmentations: usize,
    /// Objects created.
    pub objects: Vec<LinkedObject>,
    /// New segmentation-to-object assignments.
    pub assignments: Vec<Assignment>,
    /// Links that were not followed.
    pub rejections: Vec<Rejection>,
    /// Per-stage diagnostics.
    pub diagnostics: PartitionDiagnostics,
}

/// Working state threaded through the stages of one partition.
struct PartitionState<'a> {
    entries: Vec<PartitionEntry<'a>>,
    pairs: Vec<CandidatePair>,
    shifts: ShiftTable,
    links: Vec<CandidateLink>,
    chains: ChainOutcome,
}

/// Link the segmentations of one partition.
///
/// Never fails: degenerate geometry, missing shifts and rejected links are
/// all recorded in the outcome rather than raised.
pub fn link_partition<C: Clock>(
    partition: &Partition,
    mode: LinkingMode,
    config: &LinkingConfig,
    allocator: &ObjectIdAllocator,
    clock: &C,
) -> PartitionOutcome {
    let started = clock.now();
    let key = &partition.key;
    info!(
        "{mode} linking for partition {key}: {} segmentations",
        partition.records.len()
    );

    let mut cache = ProjectionCache::new();
    let mut state = PartitionState {
        entries: build_entries(&partition.records, mode, &mut cache),
        pairs: Vec::new(),
        shifts: ShiftTable::default(),
        links: Vec::new(),
        chains: ChainOutcome::default(),
    };

    let mut stages = Vec::with_capacity(mode.stages().len());
    if state.entries.is_empty() {
        info!("partition {key}: nothing to process");
    } else {
        for &stage in mode.stages() {
            let stage_started = clock.now();
            let metrics = run_stage(stage, &mut state, mode, config, allocator);
            stages.push(StageDiagnostics {
                stage,
                duration: clock.elapsed(&stage_started),
                metrics,
            });
        }
    }

    let chains = state.chains;
    info!(
        "partition {key}: {} objects created, {} assignments, {} links rejected",
        chains.objects.len(),
        chains.assignments.len(),
        chains.rejections.len()
    );

    PartitionOutcome {
        key: key.clone(),
        mode,
        segmentations: state.entries.len(),
        objects: chains.objects,
        assignments: chains.assignments,
        rejections: chains.rejections,
        diagnostics: PartitionDiagnostics {
            partition: key.to_string(),
            mode,
            stages,
            total_duration: clock.elapsed(&started),
        },
    }
}

fn run_stage(
    stage: Stage,
    state: &mut PartitionState<'_>,
    mode: LinkingMode,
    config: &LinkingConfig,
    allocator: &ObjectIdAllocator,
) -> StageMetrics {
    match stage {
        Stage::FindCandidates => {
            state.pairs = find_candidates(
                &state.entries,
                mode.bbox_margin(config),
                mode.max_gap(config),
            );
            let candidate_pairs = state.pairs.iter().filter(|p| p.target.is_some()).count();
            if candidate_pairs == 0 {
                info!("no candidate pairs among {} segmentations", state.entries.len());
            }
            let groups: BTreeSet<i64> = state.entries.iter().map(|e| e.position).collect();
            StageMetrics::FindCandidates {
                segmentations: state.entries.len(),
                groups: groups.len(),
                candidate_pairs,
                unpaired_sources: state.pairs.len() - candidate_pairs,
            }
        }
        Stage::EstimateShifts => {
            state.shifts = estimate_shifts(&state.entries, &state.pairs, &config.rounds);
            let groups: BTreeSet<i64> = state.entries.iter().map(|e| e.position).collect();
            StageMetrics::EstimateShifts {
                reference_round: state.shifts.reference,
                rounds_with_shift: state.shifts.shifts.len(),
                rounds_without_shift: groups.len() - state.shifts.shifts.len(),
                samples: state.shifts.samples.values().sum(),
            }
        }
        Stage::Score => {
            let scorer = match mode {
                LinkingMode::Rounds => Scorer::Rounds {
                    config: &config.rounds,
                    shifts: &state.shifts,
                },
                LinkingMode::Stack => Scorer::Stack {
                    config: &config.stack,
                },
            };
            let scored = score_candidates(&state.entries, &state.pairs, &scorer);
            state.links = scored.links;
            StageMetrics::Score {
                scored: scored.scored,
                missing_shift: scored.missing_shift,
                beyond_cutoff: scored.beyond_cutoff,
                degenerate: scored.degenerate,
            }
        }
        Stage::SelectMutualBest => {
            let matched = select_mutual_best(std::mem::take(&mut state.links));
            let links = matched.linked();
            state.links = matched.links;
            StageMetrics::SelectMutualBest {
                links,
                demoted: matched.demoted,
            }
        }
        Stage::BuildChains => {
            state.chains = build_chains(
                &state.links,
                mode.object_type(),
                mode.min_similarity(config),
                allocator,
            );
            let conflicts = state
                .chains
                .rejections
                .iter()
                .filter(|r| matches!(r.reason, RejectReason::AlreadyAssigned { .. }))
                .count();
            StageMetrics::BuildChains {
                objects_created: state.chains.objects.len(),
                assignments: state.chains.assignments.len(),
                rejected_conflict: conflicts,
                rejected_threshold: state.chains.rejections.len() - conflicts,
            }
        }
    }
}

/// Link every partition of a snapshot and commit the results to `sink`.
///
/// Partitions are independent. A partition whose commit fails does not
/// stop the others; the first failure is returned once all of them have
/// run, and partitions committed before it stay committed.
///
/// # Errors
///
/// Returns [`LinkingError::InvalidConfig`] before any work if `config` is
/// unusable, or the first [`LinkingError::Sink`] reported by `sink`.
pub fn link_all<C: Clock + Sync>(
    records: Vec<SegmentationRecord>,
    mode: LinkingMode,
    config: &LinkingConfig,
    allocator: &ObjectIdAllocator,
    sink: &dyn LinkSink,
    clock: &C,
    execution: Execution,
) -> Result<RunSummary, LinkingError> {
    config.validate()?;

    let partitions = partition_records(records, mode);
    if partitions.is_empty() {
        info!("{mode} linking: nothing to process");
        return Ok(RunSummary::default());
    }

    let run = |partition: &Partition| -> Result<PartitionOutcome, LinkingError> {
        let outcome = link_partition(partition, mode, config, allocator, clock);
        sink.commit(&outcome)?;
        Ok(outcome)
    };
    let results: Vec<Result<PartitionOutcome, LinkingError>> = match execution {
        Execution::Parallel => partitions.par_iter().map(run).collect(),
        Execution::Sequential => partitions.iter().map(run).collect(),
    };

    let mut summary = RunSummary::default();
    for result in results {
        let outcome = result?;
        summary.partitions += 1;
        summary.segmentations += outcome.segmentations;
        summary.objects_created += outcome.objects.len();
        summary.assignments += outcome.assignments.len();
        summary.rejections += outcome.rejections.len();
        summary.diagnostics.push(outcome.diagnostics);
    }
    info!(
        "{mode} linking: {} partitions, {} objects created",
        summary.partitions, summary.objects_created
    );
    Ok(summary)
}
