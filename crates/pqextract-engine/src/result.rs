//! Run outcome types.

use crate::writer::OutputArtifact;

/// Outcome of a run that reached the `Done` state.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_records: u64,
    pub batches_written: u64,
    pub artifacts: Vec<OutputArtifact>,
    pub duration_secs: f64,
}

impl RunSummary {
    /// Sum of artifact row counts; always equal to `total_records`.
    #[must_use]
    pub fn artifact_rows(&self) -> u64 {
        self.artifacts.iter().map(|a| a.rows as u64).sum()
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.artifacts.iter().map(|a| a.bytes).sum()
    }
}
