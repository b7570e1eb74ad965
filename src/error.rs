pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("query is empty")]
    EmptyQuery,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("embedding has dimension {got}, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("source '{suffix}' matches multiple sources: {}", .candidates.join(", "))]
    AmbiguousSource {
        suffix: String,
        candidates: Vec<String>,
    },

    #[error("model slot '{0}' is disabled by configuration")]
    ModelDisabled(String),

    #[error("cannot load '{slot}' ({needed_mb} MB) within memory budget of {budget_mb} MB")]
    MemoryBudgetExceeded {
        slot: String,
        needed_mb: u64,
        budget_mb: u64,
    },

    #[error("failed to load model slot '{slot}': {reason}")]
    ModelLoadFailed { slot: String, reason: String },

    #[error("store unavailable at {path}: {reason}")]
    StoreUnavailable { path: String, reason: String },

    #[error("daemon busy: {0}")]
    DaemonBusy(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown model slot: {0}")]
    UnknownSlot(String),

    #[error("daemon already running on {0}")]
    AlreadyRunning(String),

    #[error("daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// An error reported by the daemon, as received by the client library.
    #[error("{message}")]
    Rpc {
        code: i32,
        kind: String,
        message: String,
    },
}

impl Error {
    /// Stable machine-readable kind, carried over RPC in `error.data.kind`.
    pub fn kind(&self) -> &str {
        match self {
            Error::EmptyQuery => "EmptyQuery",
            Error::InvalidArgument(_) | Error::UnknownSlot(_) | Error::Config(_) => {
                "InvalidArgument"
            }
            Error::DimensionMismatch { .. } => "DimensionMismatch",
            Error::AmbiguousSource { .. } => "AmbiguousSource",
            Error::ModelDisabled(_) => "ModelDisabled",
            Error::MemoryBudgetExceeded { .. } => "MemoryBudgetExceeded",
            Error::ModelLoadFailed { .. } => "ModelLoadFailed",
            Error::StoreUnavailable { .. } | Error::Sqlite(_) => "StoreUnavailable",
            Error::DaemonBusy(_) | Error::AlreadyRunning(_) => "DaemonBusy",
            Error::Protocol(_) => "ProtocolError",
            Error::DaemonNotRunning(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                "InternalError"
            }
            Error::Rpc { kind, .. } => kind,
        }
    }

    /// Rebuild an error from a shared copy, used to hand one load failure to
    /// every waiter of a single-flight load.
    pub fn shared_clone(&self) -> Error {
        match self {
            Error::ModelDisabled(slot) => Error::ModelDisabled(slot.clone()),
            Error::MemoryBudgetExceeded {
                slot,
                needed_mb,
                budget_mb,
            } => Error::MemoryBudgetExceeded {
                slot: slot.clone(),
                needed_mb: *needed_mb,
                budget_mb: *budget_mb,
            },
            Error::ModelLoadFailed { slot, reason } => Error::ModelLoadFailed {
                slot: slot.clone(),
                reason: reason.clone(),
            },
            other => Error::ModelLoadFailed {
                slot: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_taxonomy() {
        assert_eq!(Error::EmptyQuery.kind(), "EmptyQuery");
        assert_eq!(
            Error::DimensionMismatch {
                expected: 768,
                got: 4
            }
            .kind(),
            "DimensionMismatch"
        );
        assert_eq!(Error::DaemonBusy("cap".into()).kind(), "DaemonBusy");
        assert_eq!(Error::Protocol("bad frame".into()).kind(), "ProtocolError");
    }

    #[test]
    fn ambiguous_source_lists_candidates() {
        let err = Error::AmbiguousSource {
            suffix: "notes.md".into(),
            candidates: vec!["a/notes.md".into(), "b/notes.md".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a/notes.md"));
        assert!(msg.contains("b/notes.md"));
    }
}
