use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{SearchHit, SearchMode};
use crate::error::Error;
use crate::manager::SlotStatus;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const SERVER_ERROR: i32 = -32000;

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications; no method in this protocol requires them,
    /// but they are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RpcErrorData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorData {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<String>>,
}

impl RpcError {
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self {
            code: PARSE_ERROR,
            message: format!("Parse error: {detail}"),
            data: Some(RpcErrorData {
                kind: "ProtocolError".to_string(),
                candidates: None,
            }),
        }
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: format!("Invalid request: {detail}"),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: format!("Invalid params: {detail}"),
            data: None,
        }
    }
}

impl From<&Error> for RpcError {
    fn from(err: &Error) -> Self {
        let candidates = match err {
            Error::AmbiguousSource { candidates, .. } => Some(candidates.clone()),
            _ => None,
        };
        Self {
            code: SERVER_ERROR,
            message: err.to_string(),
            data: Some(RpcErrorData {
                kind: err.kind().to_string(),
                candidates,
            }),
        }
    }
}

// ============================================================================
// Method payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub uptime_seconds: u64,
    pub request_count: u64,
    pub socket_path: String,
    /// Only slots currently holding a model.
    pub loaded_models: BTreeMap<String, SlotStatus>,
    pub total_memory_mb: u64,
    pub max_memory_mb: u64,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub rerank: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub mode: SearchMode,
    pub reranked: bool,
    pub search_time_ms: f64,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedParams {
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResult {
    pub embeddings: Vec<Vec<f32>>,
    pub count: usize,
    pub embed_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankParams {
    pub query: String,
    pub documents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedDoc {
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub scores: Vec<f32>,
    /// Indices into `documents`, best first.
    pub ranked: Vec<RankedDoc>,
    pub rerank_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotParams {
    pub slot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelResult {
    pub slot: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelResult {
    pub slot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReloadConfigParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfigResult {
    pub reloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub stopping: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let json = r#"{"jsonrpc":"2.0","method":"ping","params":{},"id":1}"#;
        let request: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "ping");
        assert_eq!(request.id, Some(Value::from(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let json = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let request: RpcRequest = serde_json::from_str(json).unwrap();
        assert!(request.id.is_none());
    }

    #[test]
    fn response_has_exactly_one_of_result_or_error() {
        let ok = RpcResponse::success(Value::from(1), serde_json::json!({"ok": true}));
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("result").is_some());
        assert!(json.get("error").is_none());

        let err = RpcResponse::failure(Value::from(2), RpcError::method_not_found("x"));
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn domain_errors_carry_kind() {
        let rpc: RpcError = (&Error::EmptyQuery).into();
        assert_eq!(rpc.code, SERVER_ERROR);
        assert_eq!(rpc.data.unwrap().kind, "EmptyQuery");
    }

    #[test]
    fn ambiguous_source_carries_candidates() {
        let err = Error::AmbiguousSource {
            suffix: "n.md".into(),
            candidates: vec!["a/n.md".into(), "b/n.md".into()],
        };
        let rpc: RpcError = (&err).into();
        let data = rpc.data.unwrap();
        assert_eq!(data.kind, "AmbiguousSource");
        assert_eq!(data.candidates.unwrap().len(), 2);
    }

    #[test]
    fn search_params_defaults() {
        let params: SearchParams =
            serde_json::from_value(serde_json::json!({"query": "q"})).unwrap();
        assert_eq!(params.limit, 10);
        assert_eq!(params.mode, SearchMode::Hybrid);
        assert!(!params.rerank);
        assert!(params.db_path.is_none());
    }
}
