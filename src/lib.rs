//! fastsearch -- local hybrid text search for CPU-constrained hosts.
//!
//! Documents are chunked, embedded, and indexed into a single SQLite file
//! with an FTS5 projection for BM25 and an embedding table for cosine
//! k-nearest-neighbor. Queries combine both rankings with Reciprocal Rank
//! Fusion and can be re-ordered by a cross-encoder reranker.
//!
//! A long-lived daemon keeps the embedding and reranker models resident so
//! warm queries answer in milliseconds. Clients speak length-framed
//! JSON-RPC 2.0 over a Unix socket; when no daemon is running, the client
//! library falls back to doing the work in-process.
//!
//! # Architecture
//!
//! - [`chunker`] -- paragraph-accumulating chunking with markdown section
//!   tracking
//! - [`store`] -- the single-file chunk + FTS + vector store
//! - [`engine`] -- BM25 / vector / hybrid / reranked query execution
//! - [`manager`] -- model slot lifecycle: single-flight loads, LRU budget,
//!   idle eviction
//! - [`daemon`] -- the Unix-socket JSON-RPC server
//! - [`client`] -- the client library and direct-mode fallback

pub mod chunker;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manager;
pub mod models;
pub mod store;

pub use client::FastSearchClient;
pub use config::Config;
pub use daemon::Daemon;
pub use engine::SearchEngine;
pub use error::{Error, Result};
pub use manager::ModelManager;
pub use store::SearchStore;
