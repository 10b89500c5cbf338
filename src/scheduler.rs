//! Per-session job scheduler.
//!
//! Jobs are admitted FIFO up to `max_running`. Each running job gets a
//! watchdog task that enforces its timeout; the job's exit is observed in the
//! pty output stream via [`JobScheduler::ingest`]. Every terminal transition
//! happens under the scheduler lock, is write-once, closes the job's output
//! buffer, appends one history entry and hands the freed slot to the oldest
//! pending job.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, StreamEvent};
use crate::error::{CoreError, CoreResult};
use crate::frame::{self, Frame, FrameDecoder};
use crate::history::{HistoryEntry, HistoryLog};
use crate::job::{Job, JobCommand, JobId, JobSnapshot, JobStatus};
use crate::output::OutputStream;
use crate::pty::PtyPort;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission ceiling: jobs allowed in RUNNING at once.
    pub max_running: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    /// Output tail kept in each history entry.
    pub history_output_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running: 4,
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(3600),
            history_output_bytes: 64 * 1024,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    /// False when the job was already terminal.
    pub cancelled: bool,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    Closed,
    Faulted,
}

struct JobEntry {
    job: Job,
    /// Present while the job is RUNNING.
    watchdog: Option<CancellationToken>,
}

struct State {
    mode: Mode,
    jobs: BTreeMap<JobId, JobEntry>,
    queue: VecDeque<JobId>,
    running: usize,
    next_id: u64,
}

struct Inner {
    port: Arc<dyn PtyPort>,
    config: SchedulerConfig,
    history: HistoryLog,
    broker: Broker,
    state: Mutex<State>,
    decoder: Mutex<FrameDecoder>,
    runtime: tokio::runtime::Handle,
}

/// Cheaply cloneable handle to one session's scheduler.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Must be called from within a tokio runtime; watchdogs are spawned on it.
    pub fn new(
        port: Arc<dyn PtyPort>,
        config: SchedulerConfig,
        history: HistoryLog,
        broker: Broker,
    ) -> CoreResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::InvalidState("job scheduler requires a tokio runtime".into())
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                port,
                config,
                history,
                broker,
                state: Mutex::new(State {
                    mode: Mode::Open,
                    jobs: BTreeMap::new(),
                    queue: VecDeque::new(),
                    running: 0,
                    next_id: 1,
                }),
                decoder: Mutex::new(FrameDecoder::new()),
                runtime,
            }),
        })
    }

    pub fn history(&self) -> &HistoryLog {
        &self.inner.history
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Accept a job. It starts immediately if a slot is free, otherwise it is
    /// queued as PENDING. Never waits for the command.
    ///
    /// `timeout` overrides the default and is capped at the configured maximum.
    pub fn submit(&self, command: JobCommand, timeout: Option<Duration>) -> CoreResult<JobId> {
        command.validate()?;
        let timeout = timeout
            .unwrap_or(self.inner.config.default_timeout)
            .min(self.inner.config.max_timeout);

        let mut state = self.inner.state.lock();
        ensure_open(state.mode)?;

        let id = JobId(state.next_id);
        state.next_id += 1;
        tracing::debug!(job_id = %id, command = %command.display(), "job submitted");
        state.jobs.insert(
            id,
            JobEntry {
                job: Job::new(id, command, timeout),
                watchdog: None,
            },
        );
        state.queue.push_back(id);
        self.dispatch(&mut state);
        Ok(id)
    }

    /// Current snapshot of a job, with output from `cursor` onward.
    pub fn get_status(&self, job: JobId, cursor: u64) -> CoreResult<JobSnapshot> {
        let state = self.inner.state.lock();
        let entry = state.jobs.get(&job).ok_or_else(|| CoreError::job_not_found(job))?;
        Ok(entry.job.snapshot(cursor))
    }

    /// All jobs in submission order, without output.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.inner.state.lock();
        state.jobs.values().map(|e| e.job.summary()).collect()
    }

    /// Cancel a pending or running job. Cancelling a terminal job changes
    /// nothing and reports `cancelled: false`.
    ///
    /// A running job's command is not interrupted: the shell is shared, so
    /// the job is abandoned and any further output it prints is discarded.
    pub fn cancel(&self, job: JobId) -> CoreResult<CancelOutcome> {
        let mut state = self.inner.state.lock();
        ensure_open(state.mode)?;
        let status = state
            .jobs
            .get(&job)
            .map(|e| e.job.status)
            .ok_or_else(|| CoreError::job_not_found(job))?;
        if status.is_terminal() {
            return Ok(CancelOutcome {
                cancelled: false,
                status,
            });
        }
        self.finish(&mut state, job, JobStatus::Cancelled, None);
        self.dispatch(&mut state);
        Ok(CancelOutcome {
            cancelled: true,
            status: JobStatus::Cancelled,
        })
    }

    /// Stop accepting work and cancel every non-terminal job. Returns how
    /// many jobs were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.mode = Mode::Closed;
        self.finish_outstanding(&mut state, JobStatus::Cancelled)
    }

    /// The shell is gone: fail every non-terminal job and refuse new ones.
    pub fn mark_faulted(&self) {
        let mut state = self.inner.state.lock();
        if state.mode != Mode::Open {
            return;
        }
        state.mode = Mode::Faulted;
        let failed = self.finish_outstanding(&mut state, JobStatus::Failed);
        tracing::warn!(failed, "shell terminated unexpectedly, failing outstanding jobs");
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.state.lock().mode == Mode::Faulted
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Route raw pty output to job buffers and stream subscribers, and
    /// complete jobs whose exit marker arrived.
    pub fn ingest(&self, data: &[u8]) {
        let frames = self.inner.decoder.lock().feed(data);
        for frame in frames {
            match frame {
                Frame::Terminal(data) => self.inner.broker.publish(StreamEvent::Output {
                    job: None,
                    seq: None,
                    data,
                }),
                Frame::Job { job, data } => self.append_output(job, data),
                Frame::Exit { job, code } => {
                    let mut state = self.inner.state.lock();
                    if self.finish(&mut state, job, JobStatus::for_exit_code(code), Some(code)) {
                        self.dispatch(&mut state);
                    }
                }
            }
        }
    }

    fn append_output(&self, job: JobId, data: Bytes) {
        let output = {
            let state = self.inner.state.lock();
            state.jobs.get(&job).map(|e| e.job.output.clone())
        };
        let seq = match output.map(|o| o.append(OutputStream::Pty, data.clone())) {
            Some(Ok(seq)) => Some(seq),
            Some(Err(_)) => {
                tracing::trace!(job_id = %job, bytes = data.len(), "output after job finished");
                None
            }
            None => None,
        };
        self.inner.broker.publish(StreamEvent::Output {
            job: Some(job),
            seq,
            data,
        });
    }

    /// Admit pending jobs while there is capacity.
    ///
    /// Pty writes only enqueue, so job lines reach the shell in admission
    /// order without this lock ever waiting on the shell.
    fn dispatch(&self, state: &mut State) {
        if state.mode != Mode::Open {
            return;
        }
        while state.running < self.inner.config.max_running {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            let line = frame::job_line(id, &entry.job.command.shell_source());
            if let Err(e) = self.inner.port.write(line.as_bytes()) {
                tracing::warn!(job_id = %id, error = %e, "failed to write job to pty");
                self.finish(state, id, JobStatus::Failed, None);
                continue;
            }

            entry.job.transition(JobStatus::Running, None);
            let token = CancellationToken::new();
            entry.watchdog = Some(token.clone());
            state.running += 1;
            tracing::info!(job_id = %id, running = state.running, "job started");

            let timeout = entry.job.timeout;
            let weak = Arc::downgrade(&self.inner);
            self.inner
                .runtime
                .spawn(watchdog(weak, id, timeout, token));
        }
    }

    fn finish_outstanding(&self, state: &mut State, status: JobStatus) -> usize {
        let outstanding: Vec<JobId> = state
            .jobs
            .values()
            .filter(|e| !e.job.status.is_terminal())
            .map(|e| e.job.id)
            .collect();
        outstanding
            .into_iter()
            .filter(|id| self.finish(state, *id, status, None))
            .count()
    }

    /// Apply a terminal transition. Returns false if the job is unknown or
    /// already terminal.
    fn finish(&self, state: &mut State, id: JobId, status: JobStatus, exit_code: Option<i32>) -> bool {
        let Some(entry) = state.jobs.get_mut(&id) else {
            return false;
        };
        let previous = entry.job.status;
        if !entry.job.transition(status, exit_code) {
            return false;
        }
        if let Some(token) = entry.watchdog.take() {
            token.cancel();
        }
        let record = HistoryEntry::from_job(&entry.job, self.inner.config.history_output_bytes);
        match previous {
            JobStatus::Running => state.running -= 1,
            JobStatus::Pending => state.queue.retain(|q| *q != id),
            _ => {}
        }

        tracing::info!(job_id = %id, %status, ?exit_code, "job finished");
        self.inner.history.append(record);
        self.inner.broker.publish(StreamEvent::JobFinished {
            job: id,
            status,
            exit_code,
        });
        true
    }
}

fn ensure_open(mode: Mode) -> CoreResult<()> {
    match mode {
        Mode::Open => Ok(()),
        Mode::Closed => Err(CoreError::InvalidState("session is closed".into())),
        Mode::Faulted => Err(CoreError::InvalidState(
            "session shell has terminated".into(),
        )),
    }
}

/// Times out a running job unless it finishes first.
async fn watchdog(inner: Weak<Inner>, id: JobId, timeout: Duration, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let scheduler = JobScheduler { inner };
            let mut state = scheduler.inner.state.lock();
            if scheduler.finish(&mut state, id, JobStatus::TimedOut, None) {
                tracing::warn!(job_id = %id, ?timeout, "job timed out");
                scheduler.dispatch(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RS;
    use crate::pty::PtyError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory terminal that records every line written to it.
    #[derive(Default)]
    struct FakePty {
        writes: Mutex<Vec<String>>,
        fail_writes: AtomicBool,
    }

    impl FakePty {
        /// Job ids in the order their lines were written.
        fn dispatched(&self) -> Vec<u64> {
            self.writes
                .lock()
                .iter()
                .filter_map(|line| {
                    let rest = &line[line.find("\\036x")? + 5..];
                    rest[..rest.find(';')?].parse().ok()
                })
                .collect()
        }
    }

    impl PtyPort for FakePty {
        fn write(&self, data: &[u8]) -> Result<(), PtyError> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(PtyError::Closed);
            }
            self.writes
                .lock()
                .push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }

        fn terminate(&self) -> Result<(), PtyError> {
            Ok(())
        }
    }

    fn job_output(job: u64, line: &str) -> Vec<u8> {
        let mut v = vec![RS, b'o'];
        v.extend_from_slice(job.to_string().as_bytes());
        v.push(RS);
        v.extend_from_slice(line.as_bytes());
        v
    }

    fn job_exit(job: u64, code: i32) -> Vec<u8> {
        let mut v = job_output(job, "");
        v.push(RS);
        v.extend_from_slice(format!("x{job};{code}").as_bytes());
        v.push(RS);
        v.push(b'\n');
        v
    }

    fn scheduler(max_running: usize) -> (JobScheduler, Arc<FakePty>) {
        let fake = Arc::new(FakePty::default());
        let config = SchedulerConfig {
            max_running,
            ..Default::default()
        };
        let sched = JobScheduler::new(fake.clone(), config, HistoryLog::new(), Broker::default())
            .unwrap();
        (sched, fake)
    }

    fn status(sched: &JobScheduler, id: JobId) -> JobStatus {
        sched.get_status(id, 0).unwrap().status
    }

    #[tokio::test]
    async fn ceiling_is_respected_and_admission_is_fifo() {
        let (sched, fake) = scheduler(2);
        let ids: Vec<JobId> = (0..5)
            .map(|i| sched.submit(JobCommand::line(format!("job {i}")), None).unwrap())
            .collect();

        assert_eq!(fake.dispatched(), vec![1, 2]);
        assert_eq!(sched.running_count(), 2);
        assert_eq!(sched.pending_count(), 3);
        assert_eq!(status(&sched, ids[2]), JobStatus::Pending);

        // Finishing the second job hands its slot to the oldest pending job.
        sched.ingest(&job_exit(2, 0));
        assert_eq!(fake.dispatched(), vec![1, 2, 3]);
        assert!(sched.running_count() <= 2);

        sched.ingest(&job_exit(1, 0));
        assert_eq!(fake.dispatched(), vec![1, 2, 3, 4]);
        sched.ingest(&job_exit(3, 0));
        assert_eq!(fake.dispatched(), vec![1, 2, 3, 4, 5]);
        assert_eq!(sched.running_count(), 2);
        assert_eq!(sched.pending_count(), 0);
    }

    #[tokio::test]
    async fn submit_never_waits_for_the_command() {
        let (sched, _fake) = scheduler(1);
        let id = sched.submit(JobCommand::argv(["sleep", "100"]), None).unwrap();
        assert_eq!(status(&sched, id), JobStatus::Running);
    }

    #[tokio::test]
    async fn output_and_exit_code_are_recorded() {
        let (sched, _fake) = scheduler(2);
        let ok = sched.submit(JobCommand::argv(["echo", "hello"]), None).unwrap();
        let bad = sched.submit(JobCommand::line("false"), None).unwrap();

        let mut input = b"$ ".to_vec();
        input.extend(job_output(1, "hello\n"));
        input.extend(job_exit(1, 0));
        input.extend(job_exit(2, 1));
        sched.ingest(&input);

        let snap = sched.get_status(ok, 0).unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.exit_code, Some(0));
        assert_eq!(snap.output_text(), "hello\n");
        assert!(snap.output_closed);

        let snap = sched.get_status(bad, 0).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.exit_code, Some(1));
    }

    #[tokio::test]
    async fn polling_with_cursor_is_incremental() {
        let (sched, _fake) = scheduler(1);
        let id = sched.submit(JobCommand::line("yes | head -2"), None).unwrap();
        sched.ingest(&job_output(1, "y\n"));

        let first = sched.get_status(id, 0).unwrap();
        assert_eq!(first.output_text(), "y\n");
        let again = sched.get_status(id, 0).unwrap();
        assert_eq!(again.output_text(), first.output_text());
        assert_eq!(again.cursor, first.cursor);

        sched.ingest(&job_output(1, "y\n"));
        let next = sched.get_status(id, first.cursor).unwrap();
        assert_eq!(next.output_text(), "y\n");
        assert_eq!(next.cursor, first.cursor + 1);
    }

    #[tokio::test]
    async fn cancel_pending_job_never_runs() {
        let (sched, fake) = scheduler(1);
        let first = sched.submit(JobCommand::line("sleep 5"), None).unwrap();
        let second = sched.submit(JobCommand::line("echo never"), None).unwrap();

        let outcome = sched.cancel(second).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.status, JobStatus::Cancelled);

        let snap = sched.get_status(second, 0).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.started_at_ms.is_none());

        sched.ingest(&job_exit(first.0, 0));
        assert_eq!(fake.dispatched(), vec![first.0]);
        assert_eq!(sched.running_count(), 0);
    }

    #[tokio::test]
    async fn cancel_running_job_frees_its_slot() {
        let (sched, fake) = scheduler(1);
        let first = sched.submit(JobCommand::line("sleep 5"), None).unwrap();
        let second = sched.submit(JobCommand::line("echo next"), None).unwrap();

        assert!(sched.cancel(first).unwrap().cancelled);
        assert_eq!(status(&sched, first), JobStatus::Cancelled);
        assert_eq!(status(&sched, second), JobStatus::Running);
        assert_eq!(fake.dispatched(), vec![1, 2]);

        // A late exit marker for the abandoned job changes nothing.
        sched.ingest(&job_exit(first.0, 0));
        assert_eq!(status(&sched, first), JobStatus::Cancelled);
        assert_eq!(sched.running_count(), 1);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_a_noop() {
        let (sched, _fake) = scheduler(1);
        let id = sched.submit(JobCommand::line("true"), None).unwrap();
        sched.ingest(&job_exit(id.0, 0));

        let outcome = sched.cancel(id).unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(sched.history().len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (sched, _fake) = scheduler(1);
        assert!(matches!(
            sched.get_status(JobId(42), 0),
            Err(CoreError::NotFound { kind: "job", .. })
        ));
        assert!(matches!(
            sched.cancel(JobId(42)),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_state_is_write_once() {
        let (sched, _fake) = scheduler(1);
        let id = sched.submit(JobCommand::line("echo a"), None).unwrap();
        sched.ingest(&job_exit(id.0, 0));
        let before = sched.get_status(id, 0).unwrap();

        sched.ingest(&job_output(id.0, "late\n"));
        sched.ingest(&job_exit(id.0, 7));
        let after = sched.get_status(id, 0).unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.exit_code, Some(0));
        assert_eq!(after.finished_at_ms, before.finished_at_ms);
        assert!(after.output_text().is_empty());
        assert_eq!(sched.history().len(), 1);
    }

    #[tokio::test]
    async fn job_times_out_and_frees_its_slot() {
        let (sched, fake) = scheduler(1);
        let slow = sched
            .submit(JobCommand::line("sleep 60"), Some(Duration::from_millis(50)))
            .unwrap();
        let next = sched.submit(JobCommand::line("echo next"), None).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while status(&sched, slow) != JobStatus::TimedOut {
            assert!(tokio::time::Instant::now() < deadline, "job never timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sched.get_status(slow, 0).unwrap().exit_code, None);
        assert_eq!(status(&sched, next), JobStatus::Running);
        assert_eq!(fake.dispatched(), vec![1, 2]);

        sched.ingest(&job_exit(slow.0, 0));
        assert_eq!(status(&sched, slow), JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn timeout_override_is_capped() {
        let fake = Arc::new(FakePty::default());
        let config = SchedulerConfig {
            max_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let sched =
            JobScheduler::new(fake, config, HistoryLog::new(), Broker::default()).unwrap();
        let id = sched
            .submit(JobCommand::line("sleep 60"), Some(Duration::from_secs(600)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(status(&sched, id), JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn history_follows_completion_order() {
        let (sched, _fake) = scheduler(4);
        let j1 = sched.submit(JobCommand::line("sleep 5"), None).unwrap();
        let j2 = sched.submit(JobCommand::line("true"), None).unwrap();

        sched.ingest(&job_exit(j2.0, 0));
        sched.ingest(&job_exit(j1.0, 0));

        let ids: Vec<JobId> = sched.history().list(10, 0).iter().map(|e| e.job_id).collect();
        // Most recent first.
        assert_eq!(ids, vec![j1, j2]);
    }

    #[tokio::test]
    async fn cancel_all_closes_the_scheduler() {
        let (sched, _fake) = scheduler(1);
        let a = sched.submit(JobCommand::line("sleep 5"), None).unwrap();
        let b = sched.submit(JobCommand::line("sleep 5"), None).unwrap();

        assert_eq!(sched.cancel_all(), 2);
        assert_eq!(status(&sched, a), JobStatus::Cancelled);
        assert_eq!(status(&sched, b), JobStatus::Cancelled);
        assert_eq!(sched.running_count(), 0);

        assert!(matches!(
            sched.submit(JobCommand::line("true"), None),
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(sched.cancel(a), Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn fault_fails_outstanding_jobs() {
        let (sched, _fake) = scheduler(1);
        let running = sched.submit(JobCommand::line("sleep 5"), None).unwrap();
        let pending = sched.submit(JobCommand::line("true"), None).unwrap();

        sched.mark_faulted();
        assert!(sched.is_faulted());
        for id in [running, pending] {
            let snap = sched.get_status(id, 0).unwrap();
            assert_eq!(snap.status, JobStatus::Failed);
            assert_eq!(snap.exit_code, None);
        }
        assert!(matches!(
            sched.submit(JobCommand::line("true"), None),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn failed_write_fails_job_and_moves_on() {
        let (sched, fake) = scheduler(1);
        fake.fail_writes.store(true, Ordering::Release);
        let id = sched.submit(JobCommand::line("true"), None).unwrap();
        assert_eq!(status(&sched, id), JobStatus::Failed);
        assert_eq!(sched.running_count(), 0);

        fake.fail_writes.store(false, Ordering::Release);
        let next = sched.submit(JobCommand::line("true"), None).unwrap();
        assert_eq!(status(&sched, next), JobStatus::Running);
    }

    #[tokio::test]
    async fn invalid_command_is_rejected() {
        let (sched, fake) = scheduler(1);
        assert!(matches!(
            sched.submit(JobCommand::line(""), None),
            Err(CoreError::InvalidCommand(_))
        ));
        assert!(fake.dispatched().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_output_and_completion() {
        let (sched, _fake) = scheduler(1);
        let mut sub = sched.broker().subscribe().unwrap();
        let id = sched.submit(JobCommand::line("echo hi"), None).unwrap();

        let mut input = b"$ ".to_vec();
        input.extend(job_output(id.0, "hi\n"));
        input.extend(job_exit(id.0, 0));
        sched.ingest(&input);

        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::Output {
                job: None,
                seq: None,
                data: Bytes::from_static(b"$ "),
            })
        );
        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::Output {
                job: Some(id),
                seq: Some(0),
                data: Bytes::from_static(b"hi\n"),
            })
        );
        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::JobFinished {
                job: id,
                status: JobStatus::Completed,
                exit_code: Some(0),
            })
        );
    }

    #[tokio::test]
    async fn list_jobs_is_in_submission_order() {
        let (sched, _fake) = scheduler(1);
        sched.submit(JobCommand::line("a"), None).unwrap();
        sched.submit(JobCommand::line("b"), None).unwrap();
        let jobs = sched.list_jobs();
        let commands: Vec<&str> = jobs.iter().map(|j| j.command.as_str()).collect();
        assert_eq!(commands, vec!["a", "b"]);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[1].status, JobStatus::Pending);
    }
}
