use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::SearchMode;
use crate::error::Error;

use super::protocol::*;
use super::server::DaemonState;

type HandlerResult = std::result::Result<Value, RpcError>;

/// Route one JSON-RPC request to its handler and build the response.
pub async fn dispatch(state: &DaemonState, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != JSONRPC_VERSION {
        return RpcResponse::failure(
            id,
            RpcError::invalid_request(format!("unsupported jsonrpc version '{}'", request.jsonrpc)),
        );
    }

    state.request_count.fetch_add(1, Ordering::Relaxed);
    debug!(method = %request.method, "handling request");

    let result = match request.method.as_str() {
        "ping" => handle_ping(),
        "status" => handle_status(state),
        "search" => handle_search(state, request.params).await,
        "embed" => handle_embed(state, request.params).await,
        "rerank" => handle_rerank(state, request.params).await,
        "load_model" => handle_load_model(state, request.params).await,
        "unload_model" => handle_unload_model(state, request.params),
        "reload_config" => handle_reload_config(state, request.params).await,
        "shutdown" => handle_shutdown(),
        other => Err(RpcError::method_not_found(other)),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(error) => RpcResponse::failure(id, error),
    }
}

// ============================================================================
// Method handlers
// ============================================================================

fn handle_ping() -> HandlerResult {
    to_value(&PingResult { ok: true })
}

fn handle_status(state: &DaemonState) -> HandlerResult {
    let manager_status = state.engine.manager().status();
    let loaded_models = manager_status
        .slots
        .iter()
        .filter(|(_, slot)| slot.state == "loaded")
        .map(|(name, slot)| (name.clone(), slot.clone()))
        .collect();

    to_value(&StatusResult {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        request_count: state.request_count.load(Ordering::Relaxed),
        socket_path: state.socket_path.display().to_string(),
        loaded_models,
        total_memory_mb: manager_status.total_memory_mb,
        max_memory_mb: manager_status.max_memory_mb,
    })
}

async fn handle_search(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: SearchParams = parse_params(params)?;
    let _permit = acquire_permit(
        &state.search_permits,
        state.request_timeout,
        "search",
    )
    .await?;

    let db_path = params
        .db_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_db_path);

    let started = Instant::now();
    let reranked = params.rerank && params.mode == SearchMode::Hybrid;
    let results = if reranked {
        let rerank_top_k = (params.limit * 3).min(30).max(1);
        state
            .engine
            .hybrid_reranked(&db_path, &params.query, params.limit, rerank_top_k)
            .await
    } else {
        state
            .engine
            .search(&db_path, &params.query, params.mode, params.limit)
            .await
    }
    .map_err(|e| RpcError::from(&e))?;

    to_value(&SearchResult {
        query: params.query,
        mode: params.mode,
        reranked,
        search_time_ms: elapsed_ms(started),
        results,
    })
}

async fn handle_embed(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: EmbedParams = parse_params(params)?;
    let _permit = acquire_permit(&state.embed_permits, state.request_timeout, "embed").await?;

    let started = Instant::now();
    let embeddings = state
        .engine
        .embed_texts(&params.texts)
        .await
        .map_err(|e| RpcError::from(&e))?;

    to_value(&EmbedResult {
        count: embeddings.len(),
        embeddings,
        embed_time_ms: elapsed_ms(started),
    })
}

async fn handle_rerank(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: RerankParams = parse_params(params)?;
    let _permit = acquire_permit(&state.embed_permits, state.request_timeout, "rerank").await?;

    let started = Instant::now();
    let scores = state
        .engine
        .rerank_pairs(&params.query, &params.documents)
        .await
        .map_err(|e| RpcError::from(&e))?;

    let mut ranked: Vec<RankedDoc> = scores
        .iter()
        .enumerate()
        .map(|(index, &score)| RankedDoc { index, score })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    to_value(&RerankResult {
        scores,
        ranked,
        rerank_time_ms: elapsed_ms(started),
    })
}

async fn handle_load_model(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: SlotParams = parse_params(params)?;
    let memory_mb = state
        .engine
        .manager()
        .load(&params.slot)
        .await
        .map_err(|e| RpcError::from(&e))?;

    to_value(&LoadModelResult {
        slot: params.slot,
        memory_mb,
    })
}

fn handle_unload_model(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: SlotParams = parse_params(params)?;
    state
        .engine
        .manager()
        .unload(&params.slot)
        .map_err(|e| RpcError::from(&e))?;

    to_value(&UnloadModelResult { slot: params.slot })
}

async fn handle_reload_config(state: &DaemonState, params: Option<Value>) -> HandlerResult {
    let params: ReloadConfigParams = parse_params_or_default(params)?;
    let path = params.config_path.map(PathBuf::from);

    let new_config =
        Config::load(path.as_deref()).map_err(|e| RpcError::from(&e))?;

    if new_config.daemon.socket_path != state.socket_path {
        info!(
            old = %state.socket_path.display(),
            new = %new_config.daemon.socket_path.display(),
            "socket path change requires restart; keeping current socket"
        );
    }

    state.engine.manager().reload(&new_config);
    *state.config.write().await = new_config;
    info!("configuration reloaded");

    to_value(&ReloadConfigResult { reloaded: true })
}

fn handle_shutdown() -> HandlerResult {
    to_value(&ShutdownResult { stopping: true })
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(RpcError::invalid_params)
}

fn parse_params_or_default<T: DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, RpcError> {
    match params {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(RpcError::invalid_params),
    }
}

fn to_value<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| RpcError::from(&Error::Json(e)))
}

/// Take a permit under the optional per-method cap; waiting longer than
/// the request timeout fails with `DaemonBusy`.
async fn acquire_permit(
    semaphore: &Option<Arc<Semaphore>>,
    timeout: Duration,
    method: &str,
) -> Result<Option<tokio::sync::OwnedSemaphorePermit>, RpcError> {
    let Some(semaphore) = semaphore else {
        return Ok(None);
    };
    match tokio::time::timeout(timeout, semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(Some(permit)),
        Ok(Err(_)) | Err(_) => Err(RpcError::from(&Error::DaemonBusy(format!(
            "too many concurrent {method} requests"
        )))),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
