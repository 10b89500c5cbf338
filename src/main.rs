//! jobsh - remote job shell server
//!
//! `jobsh server` starts the HTTP/WebSocket API. Sessions are opened on
//! demand by clients; each one owns a shell behind a PTY and runs submitted
//! commands as jobs.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use jobsh::{
    api,
    config::{self, Config, ConfigError},
    session::SessionManager,
};

/// jobsh - remote job shell
///
/// Runs commands inside long-lived shell sessions and exposes their status,
/// output and history over HTTP/WebSocket.
#[derive(ClapParser, Debug)]
#[command(name = "jobsh", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the job shell server
    Server {
        /// Address to bind the HTTP/WebSocket API server
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bearer token required on every API call (falls back to
        /// TERMINAL_API_KEY)
        #[arg(long, env = "JOBSH_TOKEN")]
        token: Option<String>,

        /// POSIX shell to spawn for each session (default /bin/sh)
        #[arg(long)]
        shell: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum concurrent sessions
        #[arg(long)]
        max_sessions: Option<usize>,

        /// Jobs allowed to run at once per session
        #[arg(long)]
        max_running: Option<usize>,

        /// Seconds of inactivity before a session is closed
        #[arg(long)]
        idle_timeout: Option<u64>,
    },
}

#[derive(Error, Debug)]
pub enum JobshError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("invalid bind address {0:?}: {1}")]
    InvalidBind(String, std::net::AddrParseError),

    #[error("refusing to listen on {0} without a token (set --token or JOBSH_TOKEN)")]
    TokenRequired(SocketAddr),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command line overrides applied on top of the config file.
#[derive(Debug, Default)]
struct Overrides {
    bind: Option<SocketAddr>,
    token: Option<String>,
    shell: Option<String>,
    max_sessions: Option<usize>,
    max_running: Option<usize>,
    idle_timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind.to_string();
        }
        if let Some(token) = self.token.filter(|t| !t.is_empty()) {
            config.server.token = Some(token);
        }
        if let Some(shell) = self.shell {
            config.session.shell = shell;
        }
        if let Some(n) = self.max_sessions {
            config.session.max_sessions = n;
        }
        if let Some(n) = self.max_running {
            config.job.max_running = n;
        }
        if let Some(secs) = self.idle_timeout {
            config.session.idle_timeout_secs = secs;
        }
    }
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

#[tokio::main]
async fn main() -> Result<(), JobshError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Server {
            bind,
            token,
            shell,
            config,
            max_sessions,
            max_running,
            idle_timeout,
        } => {
            let token = token.or_else(|| std::env::var("TERMINAL_API_KEY").ok());
            let overrides = Overrides {
                bind,
                token,
                shell,
                max_sessions,
                max_running,
                idle_timeout,
            };
            let config = load_config(config, overrides)?;
            run_server(config).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jobsh=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<PathBuf>, overrides: Overrides) -> Result<Config, JobshError> {
    let path = path.or_else(config::default_path);
    let mut config = match path {
        Some(ref p) => match Config::load(p)? {
            Some(c) => {
                tracing::info!(path = %p.display(), "loaded config");
                c
            }
            None => Config::default(),
        },
        None => Config::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: Config) -> Result<(), JobshError> {
    tracing::info!("jobsh server starting");

    let bind: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| JobshError::InvalidBind(config.server.bind.clone(), e))?;
    let token = config.server.token.clone();
    if token.is_none() && !is_loopback(&bind) {
        return Err(JobshError::TokenRequired(bind));
    }
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    let sessions = SessionManager::new(config.manager_config());
    let state = api::AppState::new(sessions.clone());
    let app = api::router(
        state,
        api::RouterConfig {
            token,
            bind,
            cors_origins: config.server.cors_origins.clone(),
            rate_limit: config.server.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    let shutdown = CancellationToken::new();
    let sweeper = sessions.spawn_sweeper(shutdown.clone());

    let server_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            server_shutdown.cancelled().await;
        })
        .await
    });

    tracing::info!(
        shell = %config.session.shell,
        max_sessions = config.session.max_sessions,
        max_running = config.job.max_running,
        "jobsh server ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // Close sessions first: that ends every live stream, which lets the
    // graceful shutdown below finish instead of waiting on open sockets.
    let closed = sessions.close_all().await;
    tracing::info!(closed, "closed all sessions");

    shutdown.cancel();
    if let Err(e) = http_handle.await? {
        tracing::warn!(error = %e, "HTTP server error");
    }
    sweeper.await?;

    tracing::info!("jobsh server exiting");
    Ok(())
}
