//! Write side of the linking pipeline.
//!
//! Each partition is handed to a [`LinkSink`] as one unit. A sink must
//! persist all of a partition's decisions or none of them.

use parking_lot::Mutex;

use crate::pipeline::PartitionOutcome;
use crate::types::LinkingError;

/// Receives the decisions of finished partitions.
///
/// Partitions may be committed from several threads at once and in any
/// order.
pub trait LinkSink: Send + Sync {
    /// Persist `outcome` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`LinkingError::Sink`] if the partition could not be stored.
    fn commit(&self, outcome: &PartitionOutcome) -> Result<(), LinkingError>;
}

/// Sink that keeps committed partitions in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: Mutex<Vec<PartitionOutcome>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed partitions, sorted by partition key.
    #[must_use]
    pub fn into_outcomes(self) -> Vec<PartitionOutcome> {
        let mut outcomes = self.committed.into_inner();
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        outcomes
    }

    /// Number of committed partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.committed.lock().len()
    }

    /// Returns `true` if nothing has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.lock().is_empty()
    }
}

impl LinkSink for MemorySink {
    fn commit(&self, outcome: &PartitionOutcome) -> Result<(), LinkingError> {
        self.committed.lock().push(outcome.clone());
        Ok(())
    }
}
