use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, KeepLoaded};
use crate::engine::SearchEngine;
use crate::error::{Error, Result};
use crate::manager::ModelManager;
use crate::models::ModelFactory;

use super::framing::{write_frame, FrameError, FrameReader};
use super::handlers;
use super::protocol::{RpcError, RpcRequest, RpcResponse};

/// Shared state for the daemon.
#[derive(Clone)]
pub struct DaemonState {
    pub config: Arc<RwLock<Config>>,
    pub engine: SearchEngine,
    pub request_count: Arc<AtomicU64>,
    pub start_time: Instant,
    pub shutdown_tx: broadcast::Sender<()>,
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
    pub search_permits: Option<Arc<Semaphore>>,
    pub embed_permits: Option<Arc<Semaphore>>,
}

/// The local-socket JSON-RPC server keeping models warm between requests.
pub struct Daemon {
    state: DaemonState,
    listener: UnixListener,
    sweeper: tokio::task::JoinHandle<()>,
    connection_budget: Arc<Semaphore>,
}

impl Daemon {
    /// Bind the socket, preload `always` slots, and start the idle
    /// sweeper. The daemon does not serve until `run_until_shutdown`.
    pub async fn start(config: Config, factory: Arc<dyn ModelFactory>) -> Result<Self> {
        let socket_path = config.daemon.socket_path.clone();
        let listener = bind_socket(&socket_path).await?;

        write_pid_file(&config.daemon.pid_path)?;

        let manager = ModelManager::new(&config, factory);
        let request_timeout = Duration::from_secs(config.daemon.request_timeout_seconds);
        let engine = SearchEngine::new(manager.clone()).with_acquire_timeout(request_timeout);

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = DaemonState {
            search_permits: config
                .daemon
                .max_concurrent_searches
                .map(|n| Arc::new(Semaphore::new(n))),
            embed_permits: config
                .daemon
                .max_concurrent_embeds
                .map(|n| Arc::new(Semaphore::new(n))),
            request_timeout,
            config: Arc::new(RwLock::new(config)),
            engine,
            request_count: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
            shutdown_tx,
            socket_path,
        };

        preload_always_slots(&state).await;
        let sweeper = state.engine.manager().spawn_idle_sweeper();

        let max_connections = state.config.read().await.daemon.max_connections;
        info!(
            socket = %state.socket_path.display(),
            "fastsearch daemon listening"
        );

        Ok(Self {
            state,
            listener,
            sweeper,
            connection_budget: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.state.socket_path
    }

    /// Trigger graceful shutdown from outside the accept loop.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.state.shutdown_tx.clone()
    }

    /// Serve until a shutdown RPC or a termination signal arrives.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        let mut connections = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let Ok(permit) = self.connection_budget.clone().try_acquire_owned()
                            else {
                                // Bounded accept queue: refuse instead of
                                // queueing indefinitely.
                                warn!("connection refused: at capacity");
                                drop(stream);
                                continue;
                            };
                            let state = self.state.clone();
                            connections.spawn(async move {
                                handle_connection(state, stream).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, draining connections");
                    break;
                }
                _ = shutdown_signal() => {
                    info!("termination signal received");
                    break;
                }
            }
        }

        drop(self.listener);

        // Give in-flight requests a moment, then cut them off.
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .is_err()
        {
            warn!("drain timed out, aborting remaining connections");
            connections.abort_all();
        }

        self.sweeper.abort();
        self.state.engine.manager().shutdown();

        let config = self.state.config.read().await;
        remove_file_if_exists(&self.state.socket_path);
        remove_file_if_exists(&config.daemon.pid_path);
        info!("fastsearch daemon stopped");
        Ok(())
    }
}

// ============================================================================
// Connection handling
// ============================================================================

/// Serve one connection: read a frame, dispatch, write the response, in
/// order. A client hang-up mid-request abandons the in-flight work.
async fn handle_connection(state: DaemonState, stream: UnixStream) {
    let conn_id = Uuid::new_v4();
    debug!(%conn_id, "client connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half);

    loop {
        let frame = match frames.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(FrameError::TooLarge(len)) => {
                warn!(%conn_id, len, "oversize frame, closing connection");
                break;
            }
            Err(e) => {
                debug!(%conn_id, "read failed: {e}");
                break;
            }
        };

        let request: RpcRequest = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Malformed JSON: answer with a parse error, then close.
                let response = RpcResponse::failure(
                    serde_json::Value::Null,
                    RpcError::parse_error(e),
                );
                send_response(&mut write_half, &response, &conn_id).await;
                break;
            }
        };

        let is_notification = request.id.is_none();
        let is_shutdown = request.method == "shutdown";

        let dispatch = handlers::dispatch(&state, request);
        tokio::pin!(dispatch);

        // Poll the socket alongside the handler so EOF cancels the work.
        let response = loop {
            tokio::select! {
                response = &mut dispatch => break Some(response),
                hangup = frames.hangup_or_data() => {
                    if hangup {
                        debug!(%conn_id, "client went away mid-request");
                        break None;
                    }
                }
            }
        };

        let Some(response) = response else {
            return;
        };

        if !is_notification && !send_response(&mut write_half, &response, &conn_id).await {
            break;
        }

        if is_shutdown && response.error.is_none() {
            let _ = state.shutdown_tx.send(());
            break;
        }
    }

    debug!(%conn_id, "client disconnected");
}

async fn send_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &RpcResponse,
    conn_id: &Uuid,
) -> bool {
    let body = match serde_json::to_vec(response) {
        Ok(body) => body,
        Err(e) => {
            error!(%conn_id, "response serialization failed: {e}");
            return false;
        }
    };
    if let Err(e) = write_frame(write_half, &body).await {
        debug!(%conn_id, "write failed: {e}");
        return false;
    }
    true
}

// ============================================================================
// Socket and process hygiene
// ============================================================================

/// Bind the listening socket with 0600 permissions.
///
/// An address answered by a live daemon is refused; a stale socket file
/// left by a crashed process is unlinked first.
async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        let probe = tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(path)).await;
        match probe {
            Ok(Ok(_)) => {
                return Err(Error::AlreadyRunning(path.display().to_string()));
            }
            _ => {
                info!(socket = %path.display(), "removing stale socket file");
                std::fs::remove_file(path)?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn remove_file_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), "cleanup failed: {e}");
        }
    }
}

/// Load every `always` slot up front so the first request is warm. A slot
/// that fails to load is logged; the daemon still starts.
async fn preload_always_slots(state: &DaemonState) {
    let always: Vec<String> = {
        let config = state.config.read().await;
        config
            .models
            .iter()
            .filter(|(_, cfg)| cfg.keep_loaded == KeepLoaded::Always)
            .map(|(name, _)| name.clone())
            .collect()
    };

    for slot in always {
        if let Err(e) = state.engine.manager().load(&slot).await {
            error!(slot = %slot, "preload failed: {e}");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
