use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::job::{epoch_ms, Job, JobId, JobStatus};

/// Immutable record of a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub command: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub submitted_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: u64,
    /// Tail of the job's output, lossily decoded.
    pub output: String,
    pub output_truncated: bool,
}

impl HistoryEntry {
    /// Build an entry from a job that has reached a terminal status.
    pub fn from_job(job: &Job, max_output_bytes: usize) -> Self {
        debug_assert!(job.status.is_terminal());
        let total = job.output.total_bytes();
        Self {
            job_id: job.id,
            command: job.command.display(),
            status: job.status,
            exit_code: job.exit_code,
            submitted_at_ms: epoch_ms(job.submitted_at),
            started_at_ms: job.started_at.map(epoch_ms),
            finished_at_ms: job.finished_at.map(epoch_ms).unwrap_or_default(),
            output: job.output.tail_string(max_output_bytes),
            output_truncated: total > max_output_bytes,
        }
    }
}

/// Append-only record of finished jobs, in completion order.
#[derive(Clone, Default)]
pub struct HistoryLog {
    entries: Arc<RwLock<Vec<HistoryEntry>>>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: HistoryEntry) {
        self.entries.write().push(entry);
    }

    /// Most recent first, skipping `offset` entries and returning at most `limit`.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
