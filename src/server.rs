//! Daemon bootstrap: socket bind, PID file, accept loop, graceful shutdown.
//!
//! Grounded in the clippy broker's `run()`/`bind_socket()` (stale-socket
//! detection, SIGTERM/SIGINT handling, socket cleanup on exit) and the
//! teacher's `shutdown_signal()` pattern for combining ctrl_c with SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_protocol::{AckPayload, Envelope};
use relay_storage::ClosedBy;
use tokio::net::UnixListener;

use crate::config::RelayConfig;
use crate::connection::{self, ConnId};
use crate::observer::{ActiveSession, ConnectionObserver};
use crate::registry::{AgentUpdate, Registry};
use crate::router::RouterHandle;
use crate::storage_handle::StorageHandle;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("another broker is already listening on {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] relay_storage::StorageError),
}

/// Bind the Unix socket, removing a stale socket file left by a crashed
/// prior instance. A socket is stale if connecting to it fails with
/// `ConnectionRefused`; anything else (a live listener) is reported as
/// [`ServerError::AlreadyRunning`]. A path that exists but isn't a socket is
/// never unlinked — that's someone else's file. Sets mode 0600 once bound,
/// since the broker's only access control is filesystem permissions on this
/// path.
async fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        #[cfg(unix)]
        let is_socket = std::os::unix::fs::FileTypeExt::is_socket(&meta.file_type());
        #[cfg(not(unix))]
        let is_socket = true;

        if !is_socket {
            return Err(ServerError::BindFailed {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "refusing to remove a non-socket file at the configured socket path",
                ),
            });
        }

        match tokio::net::UnixStream::connect(path).await {
            Ok(_) => return Err(ServerError::AlreadyRunning(path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::info!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path)?;
            }
            Err(_) => {
                // Unreadable/unexpected state; treat as stale and try to reclaim it.
                let _ = std::fs::remove_file(path);
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path).map_err(|source| ServerError::BindFailed {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

fn now_ms() -> i64 {
    relay_protocol::now_ms()
}

/// Forwards Connection lifecycle/message callbacks into the Router's command
/// channel and persists session start/end. This is the only
/// [`ConnectionObserver`] implementation; a Connection never sees the Router
/// or storage directly.
struct RouterObserver {
    router: RouterHandle,
    registry: Arc<Registry>,
    storage: Arc<StorageHandle>,
}

impl ConnectionObserver for RouterObserver {
    fn on_active(&self, _conn_id: ConnId, agent: &str, session: ActiveSession) {
        // Synchronous and ordered ahead of anything this same connection's
        // task does next (on_message/on_ack also just enqueue onto this same
        // command channel) — the agent must be routable before the Connection
        // loop can possibly hand it a SEND or ACK to forward.
        self.router.register(
            agent.to_owned(),
            session.session_id.clone(),
            session.handle.clone(),
        );

        let registry = Arc::clone(&self.registry);
        let storage = Arc::clone(&self.storage);
        let agent = agent.to_owned();
        tokio::spawn(async move {
            registry
                .register_or_update(&agent, AgentUpdate::default(), now_ms())
                .await;
            if !session.is_resumed {
                if let Err(e) = storage
                    .start_session(relay_storage::NewSession {
                        id: session.session_id.clone(),
                        agent_name: agent.clone(),
                        cli: None,
                        project_id: String::new(),
                        project_root: String::new(),
                        started_at: now_ms(),
                        resume_token: Some(session.resume_token.clone()),
                    })
                    .await
                {
                    tracing::warn!(error = %e, agent = %agent, "failed to persist session start");
                }
            }
        });
    }

    fn on_message(&self, _conn_id: ConnId, agent: &str, envelope: Envelope) {
        self.router.route(agent.to_owned(), envelope);
    }

    fn on_ack(&self, _conn_id: ConnId, agent: &str, ack: AckPayload) {
        self.router.ack(agent.to_owned(), ack);
    }

    fn on_pong(&self, _conn_id: ConnId, _agent: &str) {}

    fn on_backpressure(&self, conn_id: ConnId, agent: &str, active: bool) {
        tracing::debug!(?conn_id, agent, active, "write-queue backpressure transition");
    }

    fn on_close(&self, conn_id: ConnId, agent: Option<&str>, closed_by: ClosedBy) {
        let router = self.router.clone();
        let storage = Arc::clone(&self.storage);
        let agent = agent.map(str::to_owned);
        tokio::spawn(async move {
            if let Some(agent) = agent {
                router.unregister(agent.clone());
                if let Ok(Some(session_id)) = storage.latest_session_id(agent.clone()).await {
                    if let Err(e) = storage
                        .end_session(session_id, None, closed_by, now_ms())
                        .await
                    {
                        tracing::warn!(error = %e, agent = %agent, "failed to persist session end");
                    }
                }
            }
            tracing::debug!(?conn_id, "connection closed");
        });
    }

    fn on_error(&self, conn_id: ConnId, agent: Option<&str>, message: &str) {
        tracing::warn!(?conn_id, agent = ?agent, message, "connection error");
    }
}

/// Run the broker daemon until SIGTERM/SIGINT/ctrl_c, or (on non-Unix
/// targets) ctrl_c alone.
pub async fn run(config: RelayConfig) -> Result<(), ServerError> {
    std::fs::create_dir_all(&config.team_dir)?;
    let listener = bind_socket(&config.socket_path).await?;
    write_pid_file(&config.pid_path)?;
    tracing::info!(socket = %config.socket_path.display(), "agent-relay listening");

    let config = Arc::new(config);
    let storage = Arc::new(StorageHandle::open(&config.db_path)?);
    let registry = Arc::new(Registry::new(&config.team_dir));
    let (router, processing) = crate::router::spawn(Arc::clone(&registry), Arc::clone(&storage), Arc::clone(&config));

    let observer: Arc<dyn ConnectionObserver> = Arc::new(RouterObserver {
        router: router.clone(),
        registry: Arc::clone(&registry),
        storage: Arc::clone(&storage),
    });

    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let conn_id = connection::spawn(
                            stream,
                            Arc::clone(&config),
                            Arc::clone(&storage),
                            Arc::clone(&processing),
                            Arc::clone(&observer),
                        );
                        tracing::debug!(?conn_id, "accepted connection");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, broadcasting BYE and draining");
                break;
            }
        }
    }

    router.system_broadcast("broker shutting down".to_owned());
    tokio::time::sleep(config.close_grace).await;

    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(&config.pid_path);
    Ok(())
}

/// Resolves when either ctrl_c or (on Unix) SIGTERM is received.
fn shutdown_signal() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
    })
}

/// Read the PID file at `socket.with_extension("pid")` and send `SIGTERM`.
/// Returns an error if the PID file is missing or the process is gone.
pub fn stop(socket: &Path) -> Result<(), ServerError> {
    let pid_path = socket.with_extension("pid");
    let contents = std::fs::read_to_string(&pid_path)?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed pid file"))?;

    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
    Ok(())
}
