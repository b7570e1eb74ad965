use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::daemon::framing::{write_frame, FrameReader};
use crate::daemon::protocol::{
    EmbedResult, LoadModelResult, PingResult, ReloadConfigResult, RerankResult, RpcRequest,
    RpcResponse, SearchParams, SearchResult, ShutdownResult, StatusResult, UnloadModelResult,
    JSONRPC_VERSION,
};
use crate::engine::{SearchEngine, SearchMode};
use crate::error::{Error, Result};
use crate::manager::ModelManager;
use crate::models::ModelFactory;

/// Options for a search issued through the client or in direct mode.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub db_path: Option<PathBuf>,
    pub limit: usize,
    pub mode: SearchMode,
    pub rerank: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            db_path: None,
            limit: 10,
            mode: SearchMode::Hybrid,
            rerank: false,
        }
    }
}

struct Conn {
    frames: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client for the fastsearch daemon.
///
/// Keeps one connection open across calls. A transient I/O failure is
/// retried once after reconnecting; a `ModelLoadFailed` answer is likewise
/// retried at most once.
pub struct FastSearchClient {
    socket_path: PathBuf,
    timeout: Duration,
    conn: Option<Conn>,
    next_id: u64,
}

impl FastSearchClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(30),
            conn: None,
            next_id: 1,
        }
    }

    /// Client for the socket path named by the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.daemon.socket_path.clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if !self.socket_path.exists() {
            return Err(Error::DaemonNotRunning(
                self.socket_path.display().to_string(),
            ));
        }

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| Error::DaemonNotRunning(self.socket_path.display().to_string()))?
            .map_err(|_| Error::DaemonNotRunning(self.socket_path.display().to_string()))?;

        let (read_half, writer) = stream.into_split();
        self.conn = Some(Conn {
            frames: FrameReader::new(read_half),
            writer,
        });
        debug!(socket = %self.socket_path.display(), "connected to daemon");
        Ok(())
    }

    /// Drop the connection; the next request reconnects.
    pub fn close(&mut self) {
        self.conn = None;
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let mut retried = false;
        loop {
            self.connect().await?;
            match self.send_recv(method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.conn = None;
                    let transient = matches!(e, Error::Io(_))
                        || matches!(&e, Error::Rpc { kind, .. } if kind == "ModelLoadFailed");
                    if transient && !retried {
                        debug!(method, "retrying after transient failure: {e}");
                        retried = true;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_recv(&mut self, method: &str, params: &Value) -> Result<Value> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::DaemonNotRunning(
                self.socket_path.display().to_string(),
            ));
        };

        let id = self.next_id;
        self.next_id += 1;
        let request = RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(params.clone()),
            id: Some(Value::from(id)),
        };
        let body = serde_json::to_vec(&request)?;

        write_frame(&mut conn.writer, &body)
            .await
            .map_err(frame_to_io)?;

        let frame = tokio::time::timeout(self.timeout, conn.frames.read_frame())
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for daemon response",
                ))
            })?
            .map_err(frame_to_io)?
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                ))
            })?;

        let response: RpcResponse = serde_json::from_slice(&frame)?;
        if let Some(error) = response.error {
            return Err(Error::Rpc {
                code: error.code,
                kind: error
                    .data
                    .map(|d| d.kind)
                    .unwrap_or_else(|| "InternalError".to_string()),
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    // ------------------------------------------------------------------
    // One method per RPC
    // ------------------------------------------------------------------

    pub async fn ping(&mut self) -> Result<bool> {
        let value = self.request("ping", serde_json::json!({})).await?;
        let result: PingResult = serde_json::from_value(value)?;
        Ok(result.ok)
    }

    pub async fn status(&mut self) -> Result<StatusResult> {
        let value = self.request("status", serde_json::json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn search(&mut self, query: &str, opts: &SearchOptions) -> Result<SearchResult> {
        let params = SearchParams {
            query: query.to_string(),
            db_path: opts
                .db_path
                .as_ref()
                .map(|p| p.display().to_string()),
            limit: opts.limit,
            mode: opts.mode,
            rerank: opts.rerank,
        };
        let value = self
            .request("search", serde_json::to_value(&params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn embed(&mut self, texts: &[String]) -> Result<EmbedResult> {
        let value = self
            .request("embed", serde_json::json!({ "texts": texts }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn rerank(&mut self, query: &str, documents: &[String]) -> Result<RerankResult> {
        let value = self
            .request(
                "rerank",
                serde_json::json!({ "query": query, "documents": documents }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn load_model(&mut self, slot: &str) -> Result<LoadModelResult> {
        let value = self
            .request("load_model", serde_json::json!({ "slot": slot }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn unload_model(&mut self, slot: &str) -> Result<UnloadModelResult> {
        let value = self
            .request("unload_model", serde_json::json!({ "slot": slot }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn reload_config(&mut self, config_path: Option<&Path>) -> Result<ReloadConfigResult> {
        let params = match config_path {
            Some(path) => serde_json::json!({ "config_path": path.display().to_string() }),
            None => serde_json::json!({}),
        };
        let value = self.request("reload_config", params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ask the daemon to stop. The daemon responds before it drains.
    pub async fn shutdown(&mut self) -> Result<ShutdownResult> {
        let value = self.request("shutdown", serde_json::json!({})).await?;
        self.close();
        Ok(serde_json::from_value(value)?)
    }
}

fn frame_to_io(err: crate::daemon::framing::FrameError) -> Error {
    match err {
        crate::daemon::framing::FrameError::Io(e) => Error::Io(e),
        other => Error::Protocol(other.to_string()),
    }
}

// ============================================================================
// Direct mode
// ============================================================================

/// Runs the embedder and store in-process, exposing the same search call
/// the daemon answers. Cold-start latency, no daemon required.
pub struct DirectSearcher {
    engine: SearchEngine,
}

impl DirectSearcher {
    pub fn new(config: &Config, factory: Arc<dyn ModelFactory>) -> Self {
        let manager = ModelManager::new(config, factory);
        Self {
            engine: SearchEngine::new(manager),
        }
    }

    pub fn engine(&self) -> &SearchEngine {
        &self.engine
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResult> {
        let db_path = opts
            .db_path
            .clone()
            .unwrap_or_else(Config::default_db_path);

        let started = Instant::now();
        let reranked = opts.rerank && opts.mode == SearchMode::Hybrid;
        let results = if reranked {
            let rerank_top_k = (opts.limit * 3).min(30).max(1);
            self.engine
                .hybrid_reranked(&db_path, query, opts.limit, rerank_top_k)
                .await?
        } else {
            self.engine
                .search(&db_path, query, opts.mode, opts.limit)
                .await?
        };

        Ok(SearchResult {
            query: query.to_string(),
            mode: opts.mode,
            reranked,
            search_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            results,
        })
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.engine.embed_texts(texts).await
    }
}

/// Probe whether a daemon answers on `socket_path`, with a bounded
/// connect attempt.
pub async fn daemon_running(socket_path: &Path) -> bool {
    if !socket_path.exists() {
        return false;
    }
    matches!(
        tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

/// Search through the daemon when it is up, falling back to direct mode.
///
/// Daemon absence is a normal branch, not an error.
pub async fn search_auto(
    config: &Config,
    factory: Arc<dyn ModelFactory>,
    query: &str,
    opts: &SearchOptions,
) -> Result<SearchResult> {
    if daemon_running(&config.daemon.socket_path).await {
        let mut client = FastSearchClient::from_config(config);
        client.search(query, opts).await
    } else {
        info!("daemon not running, searching in-process");
        DirectSearcher::new(config, factory).search(query, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_options_defaults() {
        let opts = SearchOptions::default();
        assert_eq!(opts.limit, 10);
        assert_eq!(opts.mode, SearchMode::Hybrid);
        assert!(!opts.rerank);
    }

    #[tokio::test]
    async fn missing_socket_is_daemon_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = FastSearchClient::new(tmp.path().join("absent.sock"));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, Error::DaemonNotRunning(_)));
    }

    #[tokio::test]
    async fn daemon_running_probe_is_false_without_socket() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!daemon_running(&tmp.path().join("absent.sock")).await);
    }
}
