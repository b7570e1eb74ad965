//! End-to-end tests for the fastsearch daemon: a real Unix socket, the
//! length-framed JSON-RPC protocol, and the client library, with a fake
//! model factory standing in for fastembed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use fastsearch::client::{FastSearchClient, SearchOptions};
use fastsearch::config::{Config, KeepLoaded, ModelSlotConfig};
use fastsearch::daemon::Daemon;
use fastsearch::engine::SearchMode;
use fastsearch::error::{Error, Result};
use fastsearch::models::{Embedder, ModelFactory, ModelInstance, Reranker};
use fastsearch::store::{ChunkInsert, SearchStore};

const DIM: usize = 4;

/// Maps any text mentioning "tokio" east, everything else north.
struct FakeEmbedder;

impl Embedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                if t.contains("tokio") {
                    vec![1.0, 0.0, 0.0, 0.0]
                } else {
                    vec![0.0, 1.0, 0.0, 0.0]
                }
            })
            .collect())
    }
}

/// Scores documents by length so rerank order is predictable.
struct FakeReranker;

impl Reranker for FakeReranker {
    fn score_pairs(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
        Ok(documents.iter().map(|d| d.len() as f32).collect())
    }
}

struct CountingFactory {
    loads: AtomicUsize,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            loads: AtomicUsize::new(0),
        }
    }
}

impl ModelFactory for CountingFactory {
    fn load(&self, slot: &str, _config: &ModelSlotConfig) -> Result<ModelInstance> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match slot {
            "embedder" => Ok(ModelInstance::Embedder(Arc::new(FakeEmbedder))),
            "reranker" => Ok(ModelInstance::Reranker(Arc::new(FakeReranker))),
            other => Err(Error::UnknownSlot(other.to_string())),
        }
    }
}

struct TestDaemon {
    socket: PathBuf,
    pid: PathBuf,
    handle: tokio::task::JoinHandle<()>,
    factory: Arc<CountingFactory>,
    _tmp: tempfile::TempDir,
}

fn slot(name: &str, policy: KeepLoaded) -> ModelSlotConfig {
    ModelSlotConfig {
        name: format!("fake/{name}"),
        keep_loaded: policy,
        idle_timeout_seconds: 0,
        memory_estimate_mb: 10,
    }
}

async fn start_daemon() -> TestDaemon {
    let tmp = tempfile::tempdir().unwrap();
    let socket = tmp.path().join("fastsearch.sock");
    let pid = tmp.path().join("fastsearch.pid");

    let mut config = Config::default();
    config.daemon.socket_path = socket.clone();
    config.daemon.pid_path = pid.clone();
    config
        .models
        .insert("embedder".to_string(), slot("embedder", KeepLoaded::Always));
    config
        .models
        .insert("reranker".to_string(), slot("reranker", KeepLoaded::OnDemand));
    config.memory.max_ram_mb = 1000;

    let factory = Arc::new(CountingFactory::new());
    let daemon = Daemon::start(config, factory.clone()).await.unwrap();
    let handle = tokio::spawn(async move {
        daemon.run_until_shutdown().await.unwrap();
    });

    TestDaemon {
        socket,
        pid,
        handle,
        factory,
        _tmp: tmp,
    }
}

fn client_for(daemon: &TestDaemon) -> FastSearchClient {
    FastSearchClient::new(daemon.socket.clone())
}

fn seed_store(dir: &Path) -> PathBuf {
    let db = dir.join("docs.db");
    let mut store = SearchStore::create(&db, DIM).unwrap();
    store
        .insert_batch(&[
            ChunkInsert {
                source: "a.md".into(),
                chunk_index: 0,
                content: "rust tokio runtime internals".into(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                metadata: HashMap::new(),
            },
            ChunkInsert {
                source: "b.md".into(),
                chunk_index: 0,
                content: "slow cooking recipes for winter evenings and more".into(),
                embedding: vec![0.0, 1.0, 0.0, 0.0],
                metadata: HashMap::new(),
            },
        ])
        .unwrap();
    db
}

/// One raw framed request on a fresh connection; `None` when the server
/// closes without answering.
async fn raw_roundtrip(socket: &Path, body: &[u8]) -> Option<serde_json::Value> {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(body).await.unwrap();

    read_frame(&mut stream).await
}

async fn read_frame(stream: &mut UnixStream) -> Option<serde_json::Value> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

async fn stop(daemon: TestDaemon) {
    let mut client = client_for(&daemon);
    let _ = client.shutdown().await;
    let _ = daemon.handle.await;
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn ping_and_status() {
    let daemon = start_daemon().await;
    let mut client = client_for(&daemon);

    assert!(client.ping().await.unwrap());

    let status = client.status().await.unwrap();
    assert_eq!(status.socket_path, daemon.socket.display().to_string());
    assert!(status.request_count >= 1);
    assert_eq!(status.max_memory_mb, 1000);
    // The always-policy embedder was preloaded at startup.
    assert!(status.loaded_models.contains_key("embedder"));
    assert!(!status.loaded_models.contains_key("reranker"));

    stop(daemon).await;
}

#[tokio::test]
async fn embed_returns_vectors() {
    let daemon = start_daemon().await;
    let mut client = client_for(&daemon);

    let result = client
        .embed(&["tokio talk".to_string(), "soup".to_string()])
        .await
        .unwrap();
    assert_eq!(result.count, 2);
    assert_eq!(result.embeddings[0], vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(result.embeddings[1], vec![0.0, 1.0, 0.0, 0.0]);
    assert!(result.embed_time_ms >= 0.0);

    // The preload was the only factory invocation.
    assert_eq!(daemon.factory.loads.load(Ordering::SeqCst), 1);

    stop(daemon).await;
}

#[tokio::test]
async fn search_modes_over_rpc() {
    let daemon = start_daemon().await;
    let db = seed_store(daemon._tmp.path());
    let mut client = client_for(&daemon);

    let opts = SearchOptions {
        db_path: Some(db.clone()),
        limit: 5,
        mode: SearchMode::Bm25,
        rerank: false,
    };
    let result = client.search("tokio", &opts).await.unwrap();
    assert_eq!(result.mode, SearchMode::Bm25);
    assert!(!result.reranked);
    assert_eq!(result.results[0].source, "a.md");
    assert!(result.search_time_ms >= 0.0);

    let opts = SearchOptions {
        mode: SearchMode::Hybrid,
        ..opts
    };
    let result = client.search("tokio runtime", &opts).await.unwrap();
    assert_eq!(result.results[0].source, "a.md");
    assert!(result.results[0].rrf_score.is_some());

    stop(daemon).await;
}

#[tokio::test]
async fn reranked_search_loads_reranker_on_demand() {
    let daemon = start_daemon().await;
    let db = seed_store(daemon._tmp.path());
    let mut client = client_for(&daemon);

    let opts = SearchOptions {
        db_path: Some(db),
        limit: 2,
        mode: SearchMode::Hybrid,
        rerank: true,
    };
    let result = client.search("rust", &opts).await.unwrap();
    assert!(result.reranked);
    // FakeReranker scores by length, so the longer b.md chunk wins.
    assert_eq!(result.results[0].source, "b.md");
    assert!(result.results[0].rerank_score.is_some());

    let status = client.status().await.unwrap();
    assert!(status.loaded_models.contains_key("reranker"));
    assert_eq!(daemon.factory.loads.load(Ordering::SeqCst), 2);

    stop(daemon).await;
}

#[tokio::test]
async fn load_and_unload_model_rpcs() {
    let daemon = start_daemon().await;
    let mut client = client_for(&daemon);

    let loaded = client.load_model("reranker").await.unwrap();
    assert_eq!(loaded.slot, "reranker");
    assert_eq!(loaded.memory_mb, 10);

    // Loading again is a no-op returning identical info.
    let again = client.load_model("reranker").await.unwrap();
    assert_eq!(again.memory_mb, loaded.memory_mb);
    assert_eq!(daemon.factory.loads.load(Ordering::SeqCst), 2);

    client.unload_model("reranker").await.unwrap();
    let status = client.status().await.unwrap();
    assert!(!status.loaded_models.contains_key("reranker"));

    stop(daemon).await;
}

#[tokio::test]
async fn rerank_rpc_ranks_documents() {
    let daemon = start_daemon().await;
    let mut client = client_for(&daemon);

    let docs = vec!["bb".to_string(), "dddd".to_string(), "c".to_string()];
    let result = client.rerank("query", &docs).await.unwrap();
    assert_eq!(result.scores.len(), 3);
    assert_eq!(result.ranked[0].index, 1);
    assert_eq!(result.ranked[2].index, 2);

    stop(daemon).await;
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let daemon = start_daemon().await;

    let response = raw_roundtrip(
        &daemon.socket,
        br#"{"jsonrpc":"2.0","method":"explode","id":7}"#,
    )
    .await
    .unwrap();
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["id"], 7);

    stop(daemon).await;
}

#[tokio::test]
async fn invalid_params_are_rejected() {
    let daemon = start_daemon().await;

    let response = raw_roundtrip(
        &daemon.socket,
        br#"{"jsonrpc":"2.0","method":"search","params":{"limit":3},"id":8}"#,
    )
    .await
    .unwrap();
    assert_eq!(response["error"]["code"], -32602);

    stop(daemon).await;
}

#[tokio::test]
async fn empty_query_carries_error_kind() {
    let daemon = start_daemon().await;
    let db = seed_store(daemon._tmp.path());
    let mut client = client_for(&daemon);

    let opts = SearchOptions {
        db_path: Some(db),
        ..SearchOptions::default()
    };
    let err = client.search("   ", &opts).await.unwrap_err();
    match err {
        Error::Rpc { code, kind, .. } => {
            assert_eq!(code, -32000);
            assert_eq!(kind, "EmptyQuery");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }

    stop(daemon).await;
}

#[tokio::test]
async fn parse_error_answers_then_closes() {
    let daemon = start_daemon().await;

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let garbage = b"this is not json";
    stream
        .write_all(&(garbage.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(garbage).await.unwrap();

    let response = read_frame(&mut stream).await.unwrap();
    assert_eq!(response["error"]["code"], -32700);

    // The server closed the connection after the parse error.
    assert!(read_frame(&mut stream).await.is_none());

    stop(daemon).await;
}

#[tokio::test]
async fn oversize_frame_closes_connection() {
    let daemon = start_daemon().await;

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let huge = (64 * 1024 * 1024u32) + 1;
    stream.write_all(&huge.to_be_bytes()).await.unwrap();
    stream.write_all(b"prefix of a frame").await.unwrap();

    // No response; the connection just goes away.
    assert!(read_frame(&mut stream).await.is_none());

    // The daemon itself is still healthy.
    let mut client = client_for(&daemon);
    assert!(client.ping().await.unwrap());

    stop(daemon).await;
}

#[tokio::test]
async fn responses_stay_in_request_order() {
    let daemon = start_daemon().await;

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    for id in 1..=5u32 {
        let body = format!(r#"{{"jsonrpc":"2.0","method":"ping","id":{id}}}"#);
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(body.as_bytes()).await.unwrap();
    }
    for id in 1..=5u32 {
        let response = read_frame(&mut stream).await.unwrap();
        assert_eq!(response["id"], id);
        assert_eq!(response["result"]["ok"], true);
    }

    stop(daemon).await;
}

#[tokio::test]
async fn shutdown_cleans_up_socket_and_pid() {
    let daemon = start_daemon().await;
    assert!(daemon.socket.exists());
    assert!(daemon.pid.exists());

    let mut client = client_for(&daemon);
    let result = client.shutdown().await.unwrap();
    assert!(result.stopping);

    let socket = daemon.socket.clone();
    let pid = daemon.pid.clone();
    let _ = daemon.handle.await;
    assert!(!socket.exists());
    assert!(!pid.exists());
}

#[tokio::test]
async fn second_daemon_refuses_to_bind() {
    let daemon = start_daemon().await;

    let mut config = Config::default();
    config.daemon.socket_path = daemon.socket.clone();
    config.daemon.pid_path = daemon._tmp.path().join("other.pid");
    config
        .models
        .insert("embedder".to_string(), slot("embedder", KeepLoaded::Always));

    match Daemon::start(config, Arc::new(CountingFactory::new())).await {
        Err(Error::AlreadyRunning(_)) => {}
        Err(other) => panic!("expected AlreadyRunning, got {other:?}"),
        Ok(_) => panic!("second daemon must not bind"),
    }

    stop(daemon).await;
}

#[tokio::test]
async fn socket_has_owner_only_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = start_daemon().await;
    let mode = std::fs::metadata(&daemon.socket)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    stop(daemon).await;
}
