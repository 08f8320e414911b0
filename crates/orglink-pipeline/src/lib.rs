//! orglink-pipeline: linking of segmented organoids and cells (sans-IO).
//!
//! Folds per-round and per-plane segmentations of the same physical object
//! into persistent objects through:
//! candidate pairs -> drift estimation (rounds only) -> similarity scoring ->
//! mutual-best matching -> chain building.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! snapshots and hands decisions to a caller-supplied [`LinkSink`]. Reading
//! snapshots from disk and persisting results lives in `orglink-cli` and
//! whatever storage layer sits behind it.

pub mod affine;
pub mod candidates;
pub mod chain;
pub mod config;
pub mod diagnostics;
pub mod matching;
pub mod partition;
pub mod pipeline;
pub mod projection;
pub mod shift;
pub mod similarity;
pub mod sink;
pub mod snapshot;
pub mod types;

pub use affine::{AffineTransform, TransformDecodeError};
pub use chain::{Assignment, LinkedObject, ObjectIdAllocator};
pub use config::{LinkingConfig, RoundLinkingConfig, StackLinkingConfig};
pub use diagnostics::{Clock, NoClock, PartitionDiagnostics, RunSummary};
pub use pipeline::{Execution, LinkingMode, PartitionOutcome, Stage, link_all, link_partition};
pub use sink::{LinkSink, MemorySink};
pub use snapshot::Snapshot;
pub use types::{
    Contour, ImageType, LinkingError, ObjectId, ObjectType, Point, SegmentationId,
    SegmentationRecord, Shift,
};
