use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::frame::{self, MAX_LINE_LEN};
use crate::output::{Chunk, OutputBuffer, OutputStream};

/// Job identifier, unique within its session and assigned in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether moving from `self` to `next` follows
    /// PENDING → RUNNING → {COMPLETED, FAILED, TIMED_OUT, CANCELLED}.
    ///
    /// A pending job may also go straight to CANCELLED or FAILED (never
    /// dispatched).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn for_exit_code(code: i32) -> JobStatus {
        if code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What to run. Either form is handed to the shell unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCommand {
    /// A raw shell line, interpreted by the shell as typed.
    Line(String),
    /// Program and arguments; each element is quoted before reaching the shell.
    Argv(Vec<String>),
}

impl JobCommand {
    pub fn line(s: impl Into<String>) -> Self {
        JobCommand::Line(s.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JobCommand::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Source text passed to the shell's `eval`.
    pub fn shell_source(&self) -> String {
        match self {
            JobCommand::Line(line) => line.clone(),
            JobCommand::Argv(args) => args
                .iter()
                .map(|a| frame::shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Human-readable form for listings and history.
    pub fn display(&self) -> String {
        match self {
            JobCommand::Line(line) => line.clone(),
            JobCommand::Argv(args) => args
                .iter()
                .map(|a| {
                    let plain = !a.is_empty()
                        && a.chars().all(|c| {
                            c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c)
                        });
                    if plain {
                        a.clone()
                    } else {
                        frame::shell_quote(a)
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let empty = match self {
            JobCommand::Line(line) => line.trim().is_empty(),
            JobCommand::Argv(args) => args.first().map_or(true, |a| a.is_empty()),
        };
        if empty {
            return Err(CoreError::InvalidCommand("command is empty".into()));
        }
        let source = self.shell_source();
        // The line goes through the tty's line discipline, which would act on
        // kill, interrupt, EOF and erase characters instead of passing them on.
        if let Some(c) = source
            .chars()
            .find(|c| c.is_ascii_control() && *c != '\t' && *c != '\n')
        {
            return Err(CoreError::InvalidCommand(format!(
                "command contains control character {:#04x}",
                c as u32
            )));
        }
        let line_len = frame::job_line(JobId(u64::MAX), &source).len();
        if line_len > MAX_LINE_LEN {
            return Err(CoreError::InvalidCommand(format!(
                "command too long ({line_len} bytes after wrapping, max {MAX_LINE_LEN})"
            )));
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Scheduler-side record of one job.
///
/// Identity and command never change after creation. Status, timestamps
/// and exit code are only changed through [`Job::transition`].
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub command: JobCommand,
    pub timeout: Duration,
    pub submitted_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub output: OutputBuffer,
}

impl Job {
    pub fn new(id: JobId, command: JobCommand, timeout: Duration) -> Self {
        Self {
            id,
            command,
            timeout,
            submitted_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Pending,
            exit_code: None,
            output: OutputBuffer::new(),
        }
    }

    /// Apply a status change. Returns `false` (and changes nothing) if the
    /// move is not allowed, e.g. out of a terminal state.
    pub fn transition(&mut self, next: JobStatus, exit_code: Option<i32>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = SystemTime::now();
        self.status = next;
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.exit_code = exit_code;
            self.output.close();
        }
        true
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(SystemTime::now);
        Some(end.duration_since(start).unwrap_or_default())
    }

    /// Snapshot including output chunks from `cursor` onward.
    pub fn snapshot(&self, cursor: u64) -> JobSnapshot {
        let (chunks, next_cursor) = self.output.read_since(cursor);
        let mut snap = self.summary();
        snap.output = chunks.into_iter().map(OutputChunk::from).collect();
        snap.cursor = next_cursor;
        snap
    }

    /// Snapshot without output.
    pub fn summary(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            command: self.command.display(),
            status: self.status,
            exit_code: self.exit_code,
            submitted_at_ms: epoch_ms(self.submitted_at),
            started_at_ms: self.started_at.map(epoch_ms),
            finished_at_ms: self.finished_at.map(epoch_ms),
            elapsed_ms: self.elapsed().map(|d| d.as_millis() as u64),
            output: Vec::new(),
            cursor: 0,
            output_closed: self.output.is_closed(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub seq: u64,
    pub stream: OutputStream,
    pub at_ms: u64,
    #[serde(skip)]
    pub data: bytes::Bytes,
}

impl From<Chunk> for OutputChunk {
    fn from(chunk: Chunk) -> Self {
        Self {
            seq: chunk.seq,
            stream: chunk.stream,
            at_ms: epoch_ms(chunk.at),
            data: chunk.data,
        }
    }
}

/// Point-in-time view of a job returned by status polls.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub command: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub submitted_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub elapsed_ms: Option<u64>,
    #[serde(skip)]
    pub output: Vec<OutputChunk>,
    /// Pass back as the next poll's cursor.
    pub cursor: u64,
    pub output_closed: bool,
}

impl JobSnapshot {
    /// The returned output chunks concatenated.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.output.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output_bytes()).into_owned()
    }
}
