use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default memory estimate (MB) for a slot whose config does not set one.
///
/// These are static per-model estimates; the manager budgets against them
/// rather than sampling resident memory.
pub fn default_memory_estimate_mb(slot: &str) -> u64 {
    match slot {
        "embedder" => 450,
        "reranker" => 90,
        _ => 500,
    }
}

// ============================================================================
// Daemon
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// The tracing directive level for this log level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_level: LogLevel,
    /// Connections beyond this bound are closed instead of queued.
    pub max_connections: usize,
    /// How long a request waits for a model or a method permit before
    /// failing with `DaemonBusy`.
    pub request_timeout_seconds: u64,
    /// Optional cap on concurrent `search` requests.
    pub max_concurrent_searches: Option<usize>,
    /// Optional cap on concurrent `embed`/`rerank` requests.
    pub max_concurrent_embeds: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/fastsearch.sock"),
            pid_path: PathBuf::from("/tmp/fastsearch.pid"),
            log_level: LogLevel::Info,
            max_connections: 64,
            request_timeout_seconds: 30,
            max_concurrent_searches: None,
            max_concurrent_embeds: None,
        }
    }
}

// ============================================================================
// Model slots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeepLoaded {
    /// Loaded at daemon start-up, never evicted, no idle timeout.
    Always,
    /// Loaded on first use; subject to idle timeout and eviction.
    #[default]
    OnDemand,
    /// Requests for this slot fail with `ModelDisabled`.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSlotConfig {
    /// Model identifier, e.g. `BAAI/bge-base-en-v1.5`.
    pub name: String,
    #[serde(default)]
    pub keep_loaded: KeepLoaded,
    /// Idle seconds before an on-demand slot is unloaded; 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Static memory estimate in MB; 0 means "use the built-in estimate
    /// for this slot", resolved during `Config::load`.
    #[serde(default)]
    pub memory_estimate_mb: u64,
}

fn default_idle_timeout() -> u64 {
    300
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Fifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_ram_mb: u64,
    pub eviction_policy: EvictionPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_ram_mb: 4000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// The model slot table keyed by slot name (`embedder`, `reranker`).
pub type ModelSlots = BTreeMap<String, ModelSlotConfig>;
