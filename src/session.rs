use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::broker::{Broker, Subscription, DEFAULT_SUBSCRIBER_QUEUE};
use crate::error::{CoreError, CoreResult};
use crate::frame::INIT_LINE;
use crate::history::{HistoryEntry, HistoryLog};
use crate::job::{epoch_ms, JobCommand, JobId, JobSnapshot};
use crate::pty::{PtyError, PtyHandle, PtyOutput, PtyPort};
use crate::scheduler::{CancelOutcome, JobScheduler, SchedulerConfig};

/// Validate a caller-chosen session id. Ids must be 1-64 chars,
/// ASCII alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 64 {
        return Err(format!("session id too long ({} chars, max 64)", id.len()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!(
            "session id contains invalid characters: {}",
            id.chars().take(64).collect::<String>()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// Picked by the expiration sweep; reverts to `Active` if touched first.
    Expiring,
    Closed,
    /// The shell exited or the pty failed. Jobs are refused until closed.
    Faulted,
}

/// How each session's shell and scheduler are set up.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub kill_grace: Duration,
    pub scheduler: SchedulerConfig,
    pub subscriber_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            rows: 24,
            cols: 80,
            kill_grace: Duration::from_secs(2),
            scheduler: SchedulerConfig::default(),
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Summary returned by listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub idle_ms: u64,
    pub pid: Option<u32>,
    pub running_jobs: usize,
    pub pending_jobs: usize,
    pub history_len: usize,
}

/// One shell with its job scheduler, history and live viewers.
///
/// Cloning shares the underlying session. Every caller-facing operation
/// counts as activity for the expiration sweep.
#[derive(Clone)]
pub struct Session {
    id: String,
    created_at: SystemTime,
    pty: Arc<PtyHandle>,
    scheduler: JobScheduler,
    activity: ActivityTracker,
    state: Arc<Mutex<SessionState>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pty.pid())
            .finish_non_exhaustive()
    }
}

/// Feeds the reader thread's output into the session.
struct SessionOutput {
    id: String,
    scheduler: JobScheduler,
    state: Arc<Mutex<SessionState>>,
}

impl PtyOutput for SessionOutput {
    fn on_output(&self, data: bytes::Bytes) {
        self.scheduler.ingest(&data);
    }

    fn on_closed(&self, error: Option<std::io::Error>) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Active | SessionState::Expiring) {
                *state = SessionState::Faulted;
                match &error {
                    Some(e) => tracing::error!(session_id = %self.id, error = %e, "pty read failed, session faulted"),
                    None => tracing::warn!(session_id = %self.id, "shell exited, session faulted"),
                }
            }
        }
        self.scheduler.mark_faulted();
        self.scheduler.broker().close();
    }
}

impl Session {
    /// Spawn the shell and start routing its output.
    fn open(id: String, config: &SessionConfig) -> CoreResult<Self> {
        let pty = PtyHandle::spawn(&config.shell, config.rows, config.cols, config.kill_grace)
            .map_err(CoreError::SpawnFailed)?;
        let pty = Arc::new(pty);

        let started = Self::start(id, pty.clone(), config);
        if started.is_err() {
            tokio::task::spawn_blocking(move || pty.terminate());
        }
        started
    }

    fn start(id: String, pty: Arc<PtyHandle>, config: &SessionConfig) -> CoreResult<Self> {
        let broker = Broker::new(config.subscriber_queue);
        let scheduler = JobScheduler::new(
            pty.clone(),
            config.scheduler.clone(),
            HistoryLog::new(),
            broker,
        )?;
        let state = Arc::new(Mutex::new(SessionState::Active));

        pty.start_reader(Arc::new(SessionOutput {
            id: id.clone(),
            scheduler: scheduler.clone(),
            state: state.clone(),
        }))
        .map_err(CoreError::SpawnFailed)?;
        pty.write(INIT_LINE.as_bytes())
            .map_err(CoreError::SpawnFailed)?;

        Ok(Self {
            id,
            created_at: SystemTime::now(),
            pty,
            scheduler,
            activity: ActivityTracker::new(),
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Number of times the shell's terminate has been requested.
    pub fn terminate_calls(&self) -> usize {
        self.pty.terminate_calls()
    }

    /// Whether the shell process is confirmed gone.
    pub fn shell_exited(&self) -> bool {
        self.pty.has_exited()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            created_at_ms: epoch_ms(self.created_at),
            last_activity_ms: epoch_ms(self.activity.last_activity_at()),
            idle_ms: self.activity.last_activity_ms(),
            pid: self.pid(),
            running_jobs: self.scheduler.running_count(),
            pending_jobs: self.scheduler.pending_count(),
            history_len: self.scheduler.history().len(),
        }
    }

    pub fn submit(&self, command: JobCommand, timeout: Option<Duration>) -> CoreResult<JobId> {
        self.activity.touch();
        self.ensure_usable()?;
        let id = self.scheduler.submit(command, timeout)?;
        tracing::debug!(session_id = %self.id, job_id = %id, "job accepted");
        Ok(id)
    }

    pub fn get_status(&self, job: JobId, cursor: u64) -> CoreResult<JobSnapshot> {
        self.activity.touch();
        self.scheduler.get_status(job, cursor)
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.activity.touch();
        self.scheduler.list_jobs()
    }

    pub fn cancel(&self, job: JobId) -> CoreResult<CancelOutcome> {
        self.activity.touch();
        if self.state() == SessionState::Closed {
            return Err(CoreError::InvalidState("session is closed".into()));
        }
        self.scheduler.cancel(job)
    }

    /// Finished jobs, most recent first, plus the total count.
    pub fn history(&self, limit: usize, offset: usize) -> (Vec<HistoryEntry>, usize) {
        self.activity.touch();
        let log = self.scheduler.history();
        (log.list(limit, offset), log.len())
    }

    /// Write raw bytes to the shell, as if typed.
    pub fn write_input(&self, data: &[u8]) -> CoreResult<()> {
        self.activity.touch();
        self.ensure_usable()?;
        self.pty.write(data).map_err(|e| match e {
            PtyError::InputQueueFull => CoreError::ResourceExhausted(e.to_string()),
            e => CoreError::InvalidState(format!("failed to write to shell: {e}")),
        })
    }

    /// Attach a live viewer to everything the session prints from now on.
    pub fn subscribe(&self) -> CoreResult<Subscription> {
        self.activity.touch();
        self.ensure_usable()?;
        self.scheduler.broker().subscribe()
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        match self.state() {
            SessionState::Active | SessionState::Expiring => Ok(()),
            SessionState::Closed => Err(CoreError::InvalidState("session is closed".into())),
            SessionState::Faulted => Err(CoreError::InvalidState(
                "session shell has terminated".into(),
            )),
        }
    }

    fn begin_expiry(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Active {
            *state = SessionState::Expiring;
            true
        } else {
            false
        }
    }

    fn abort_expiry(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Expiring {
            *state = SessionState::Active;
        }
    }

    /// Cancel outstanding jobs, disconnect viewers and terminate the shell.
    /// Returns once the shell is gone (bounded by the kill grace period).
    async fn shutdown(&self) {
        *self.state.lock() = SessionState::Closed;
        let cancelled = self.scheduler.cancel_all();
        self.scheduler.broker().close();

        let pty = self.pty.clone();
        match tokio::task::spawn_blocking(move || pty.terminate()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session_id = %self.id, error = %e, "failed to terminate shell"),
            Err(e) => tracing::error!(session_id = %self.id, error = %e, "terminate task failed"),
        }
        tracing::info!(session_id = %self.id, cancelled, "session closed");
    }
}

/// Limits applied by the [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session: SessionConfig,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_sessions: 64,
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Owns every live session.
///
/// Removal from the map happens under the write lock and only the caller
/// that removed a session tears it down, so an explicit close and the
/// expiration sweep never both terminate the same shell.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    config: Arc<ManagerConfig>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Spawn a shell and register it as a new ACTIVE session.
    ///
    /// With `id` of `None` a UUIDv4 is assigned. Forking the shell runs on
    /// the blocking pool.
    pub async fn open_session(&self, id: Option<String>) -> CoreResult<Session> {
        let id = match id {
            Some(id) => {
                validate_session_id(&id).map_err(CoreError::InvalidArgument)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        self.check_admission(&self.sessions.read(), &id)?;

        let config = self.config.session.clone();
        let open_id = id.clone();
        let session = tokio::task::spawn_blocking(move || Session::open(open_id, &config))
            .await
            .map_err(|e| CoreError::InvalidState(format!("session spawn task failed: {e}")))??;

        let rejected = {
            let mut sessions = self.sessions.write();
            match self.check_admission(&sessions, &id) {
                Ok(()) => {
                    sessions.insert(id.clone(), session.clone());
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = rejected {
            // Lost a race with a concurrent open.
            session.shutdown().await;
            return Err(e);
        }

        tracing::info!(session_id = %id, pid = ?session.pid(), "session opened");
        Ok(session)
    }

    fn check_admission(&self, sessions: &HashMap<String, Session>, id: &str) -> CoreResult<()> {
        if sessions.contains_key(id) {
            return Err(CoreError::InvalidState(format!("session already exists: {id}")));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(CoreError::ResourceExhausted(format!(
                "maximum of {} sessions reached",
                self.config.max_sessions
            )));
        }
        Ok(())
    }

    /// Look up a session and count the lookup as activity.
    ///
    /// A session idle past the timeout is closed here rather than returned,
    /// even if the sweep has not reached it yet.
    pub async fn get_session(&self, id: &str) -> CoreResult<Session> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::session_not_found(id))?;

        if session.activity.is_expired(self.config.idle_timeout) {
            if let Some(expired) = self.remove_if_expired(&session) {
                tracing::info!(session_id = %id, "session expired on access");
                expired.shutdown().await;
            }
            return Err(CoreError::session_not_found(id));
        }
        session.activity.touch();
        Ok(session)
    }

    /// Close a session: cancel its jobs and terminate its shell before
    /// returning. Unknown or already closed ids report `NotFound`.
    pub async fn close_session(&self, id: &str) -> CoreResult<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::session_not_found(id))?;
        session.shutdown().await;
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().values().map(Session::info).collect();
        infos.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session. Used at server shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        futures::future::join_all(drained.iter().map(Session::shutdown)).await;
        count
    }

    /// Close every session idle past the timeout. Returns how many were closed.
    pub async fn sweep_once(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let candidates: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.activity.is_expired(timeout))
            .cloned()
            .collect();

        let mut expired = Vec::new();
        for session in candidates {
            let marked = session.begin_expiry();
            match self.remove_if_expired(&session) {
                Some(removed) => expired.push(removed),
                None if marked => session.abort_expiry(),
                None => {}
            }
        }

        for session in &expired {
            tracing::info!(session_id = %session.id, idle_ms = session.activity.last_activity_ms(), "session expired");
            session.shutdown().await;
        }
        expired.len()
    }

    /// Remove `session` if it is still registered and still idle.
    fn remove_if_expired(&self, session: &Session) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let current = sessions.get(&session.id)?;
        if !Arc::ptr_eq(&current.state, &session.state)
            || !current.activity.is_expired(self.config.idle_timeout)
        {
            return None;
        }
        sessions.remove(&session.id)
    }

    /// Run [`sweep_once`](Self::sweep_once) every `sweep_interval` until
    /// `shutdown` fires.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = manager.sweep_once().await;
                        if closed > 0 {
                            tracing::debug!(closed, remaining = manager.len(), "expiration sweep");
                        }
                    }
                }
            }
        })
    }
}
