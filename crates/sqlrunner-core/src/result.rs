use arrow_array::RecordBatch;

/// What the caller wants back from a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Drain the result cursor and keep every batch.
    Collect,
    /// Run for side effects; the callee releases any result.
    Ignore,
}

/// Result of executing one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// Batches in engine emission order.
    Rows(Vec<RecordBatch>),
    /// Output was not requested.
    Empty,
}

impl ExecOutcome {
    /// Number of rows across all batches.
    pub fn row_count(&self) -> usize {
        match self {
            ExecOutcome::Rows(batches) => total_rows(batches),
            ExecOutcome::Empty => 0,
        }
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        match self {
            ExecOutcome::Rows(batches) => batches,
            ExecOutcome::Empty => Vec::new(),
        }
    }
}

pub fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}
