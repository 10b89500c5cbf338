#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use jobsh::api;
use jobsh::job::{JobId, JobSnapshot};
use jobsh::session::{ManagerConfig, Session, SessionConfig, SessionManager};
use tokio::net::TcpListener;

/// Manager config running `/bin/sh` with the given admission ceiling.
pub fn test_manager_config(max_running: usize) -> ManagerConfig {
    let mut config = ManagerConfig {
        session: SessionConfig {
            shell: "/bin/sh".to_string(),
            kill_grace: Duration::from_millis(500),
            ..SessionConfig::default()
        },
        max_sessions: 8,
        ..ManagerConfig::default()
    };
    config.session.scheduler.max_running = max_running;
    config
}

pub fn test_manager(max_running: usize) -> SessionManager {
    SessionManager::new(test_manager_config(max_running))
}

/// A running HTTP server and the manager behind it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub sessions: SessionManager,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Start a server on an ephemeral loopback port.
pub async fn start_test_server(token: Option<String>) -> TestServer {
    let sessions = test_manager(4);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = api::router(
        api::AppState::new(sessions.clone()),
        api::RouterConfig {
            token,
            bind: addr,
            ..api::RouterConfig::default()
        },
    );
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer { addr, sessions }
}

/// Poll until the job reaches a terminal state, returning its full output.
pub async fn wait_for_job(session: &Session, job: JobId, timeout: Duration) -> (JobSnapshot, String) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut cursor = 0;
    let mut output = Vec::new();
    loop {
        let snap = session.get_status(job, cursor).unwrap();
        output.extend(snap.output_bytes());
        cursor = snap.cursor;
        if snap.status.is_terminal() {
            // Output that raced the terminal transition is still readable.
            let rest = session.get_status(job, cursor).unwrap();
            output.extend(rest.output_bytes());
            return (rest, String::from_utf8_lossy(&output).into_owned());
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job:?} still {:?} after {timeout:?}",
            snap.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
