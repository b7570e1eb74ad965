pub mod fusion;
pub mod sanitize;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::manager::{ModelHandle, ModelManager};
use crate::models::{EMBEDDER_SLOT, RERANKER_SLOT};
use crate::store::{Bm25Match, ChunkRow, SearchStore, VectorMatch};

/// Lexical-only and vector-only modes skip the model or the index they do
/// not need; hybrid fuses both rankings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Bm25,
    Vector,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bm25" => Ok(SearchMode::Bm25),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("invalid search mode: {other}")),
        }
    }
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Bm25 => "bm25",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub source: String,
    pub chunk_index: u32,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub rank: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vec_rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Executes the four query modes against a store, borrowing models from
/// the manager.
#[derive(Clone)]
pub struct SearchEngine {
    manager: ModelManager,
    acquire_timeout: Duration,
}

impl SearchEngine {
    pub fn new(manager: ModelManager) -> Self {
        Self {
            manager,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Bound how long a request waits for a model before `DaemonBusy`.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    /// Run a search in the given mode. Hybrid runs both legs concurrently
    /// and fuses them with RRF.
    pub async fn search(
        &self,
        db_path: &Path,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query = non_empty(query)?;
        match mode {
            SearchMode::Bm25 => self.bm25(db_path, &query, limit).await,
            SearchMode::Vector => self.vector(db_path, &query, limit).await,
            SearchMode::Hybrid => {
                let fused = self.hybrid_candidates(db_path, &query, limit).await?;
                Ok(fused.into_iter().take(limit).collect())
            }
        }
    }

    /// Hybrid search followed by cross-encoder reranking of the top
    /// `rerank_top_k` candidates. The final order is rerank score
    /// descending, ties broken by RRF score.
    pub async fn hybrid_reranked(
        &self,
        db_path: &Path,
        query: &str,
        limit: usize,
        rerank_top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let query = non_empty(query)?;
        let candidate_limit = limit.max(rerank_top_k);
        let mut candidates = self
            .hybrid_candidates(db_path, &query, candidate_limit)
            .await?;

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let top_k = rerank_top_k.min(candidates.len());
        let documents: Vec<String> = candidates[..top_k]
            .iter()
            .map(|hit| hit.content.clone())
            .collect();
        let scores = self.rerank_pairs(&query, &documents).await?;
        for (hit, score) in candidates[..top_k].iter_mut().zip(scores) {
            hit.rerank_score = Some(score);
        }

        // Scored candidates first, by score; unscored keep their RRF order.
        let mut scored: Vec<SearchHit> = candidates.drain(..top_k).collect();
        scored.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.rrf_score
                        .partial_cmp(&a.rrf_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        scored.extend(candidates);
        scored.truncate(limit);
        renumber(&mut scored);
        Ok(scored)
    }

    /// Embed a batch of texts with the embedder slot.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(Error::InvalidArgument(
                "texts must not be empty".to_string(),
            ));
        }
        let handle = self.acquire(EMBEDDER_SLOT).await?;
        let embedder = handle.embedder()?;
        let texts = texts.to_vec();
        run_blocking(move || embedder.embed_batch(&texts)).await
    }

    /// Score (query, document) pairs with the reranker slot.
    pub async fn rerank_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Err(Error::InvalidArgument(
                "documents must not be empty".to_string(),
            ));
        }
        let handle = self.acquire(RERANKER_SLOT).await?;
        let reranker = handle.reranker()?;
        let query = query.to_string();
        let documents = documents.to_vec();
        run_blocking(move || reranker.score_pairs(&query, &documents)).await
    }

    // ------------------------------------------------------------------
    // Mode implementations
    // ------------------------------------------------------------------

    async fn bm25(&self, db_path: &Path, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let matches = {
            let db_path = db_path.to_path_buf();
            let query = query.to_string();
            run_blocking(move || SearchStore::open(&db_path)?.search_bm25(&query, limit)).await?
        };
        Ok(matches
            .into_iter()
            .map(|m| hit_from_bm25(m.chunk, m.rank))
            .collect())
    }

    async fn vector(&self, db_path: &Path, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let embedding = self.embed_query(query).await?;
        let matches = {
            let db_path = db_path.to_path_buf();
            run_blocking(move || SearchStore::open(&db_path)?.search_vector(&embedding, limit))
                .await?
        };
        Ok(matches
            .into_iter()
            .map(|m| hit_from_vector(m.chunk, m.rank))
            .collect())
    }

    /// Fused hybrid candidates, already ranked, up to `limit` of them.
    async fn hybrid_candidates(
        &self,
        db_path: &Path,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let fetch = (limit * 4).max(20);
        let embedding = self.embed_query(query).await?;

        // Each leg opens its own connection; WAL lets them read in parallel.
        let bm25_task = {
            let db_path = db_path.to_path_buf();
            let query = query.to_string();
            tokio::task::spawn_blocking(move || {
                SearchStore::open(&db_path)?.search_bm25(&query, fetch)
            })
        };
        let vector_task = {
            let db_path = db_path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                SearchStore::open(&db_path)?.search_vector(&embedding, fetch)
            })
        };

        let (bm25_res, vector_res) = tokio::join!(bm25_task, vector_task);
        let bm25 = flatten_join(bm25_res)?;
        let vector = flatten_join(vector_res)?;
        debug!(
            bm25 = bm25.len(),
            vector = vector.len(),
            fetch,
            "hybrid legs fetched"
        );

        Ok(fuse_matches(bm25, vector, limit))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_texts(&[query.to_string()]).await?;
        if embeddings.is_empty() {
            return Err(Error::Internal(
                "embedder returned no vector for query".to_string(),
            ));
        }
        Ok(embeddings.remove(0))
    }

    async fn acquire(&self, slot: &str) -> Result<ModelHandle> {
        match tokio::time::timeout(self.acquire_timeout, self.manager.acquire(slot)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DaemonBusy(format!(
                "timed out waiting for model slot '{slot}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fuse the two ranked legs and materialize hits in fused order.
fn fuse_matches(bm25: Vec<Bm25Match>, vector: Vec<VectorMatch>, limit: usize) -> Vec<SearchHit> {
    let bm25_ranks: Vec<(i64, u32)> = bm25.iter().map(|m| (m.chunk.id, m.rank)).collect();
    let vector_ranks: Vec<(i64, u32)> = vector.iter().map(|m| (m.chunk.id, m.rank)).collect();

    let mut rows: HashMap<i64, ChunkRow> = HashMap::new();
    for m in bm25 {
        rows.entry(m.chunk.id).or_insert(m.chunk);
    }
    for m in vector {
        rows.entry(m.chunk.id).or_insert(m.chunk);
    }

    let fused = fusion::fuse(
        &bm25_ranks,
        &vector_ranks,
        fusion::BM25_WEIGHT,
        fusion::VECTOR_WEIGHT,
        limit,
    );

    fused
        .into_iter()
        .enumerate()
        .filter_map(|(i, f)| {
            let chunk = rows.remove(&f.id)?;
            Some(SearchHit {
                id: chunk.id,
                source: chunk.source,
                chunk_index: chunk.chunk_index,
                content: chunk.content,
                metadata: chunk.metadata,
                rank: i as u32 + 1,
                bm25_rank: f.bm25_rank,
                vec_rank: f.vec_rank,
                rrf_score: Some(f.rrf_score),
                rerank_score: None,
            })
        })
        .collect()
}

fn hit_from_bm25(chunk: ChunkRow, rank: u32) -> SearchHit {
    SearchHit {
        id: chunk.id,
        source: chunk.source,
        chunk_index: chunk.chunk_index,
        content: chunk.content,
        metadata: chunk.metadata,
        rank,
        bm25_rank: Some(rank),
        vec_rank: None,
        rrf_score: None,
        rerank_score: None,
    }
}

fn hit_from_vector(chunk: ChunkRow, rank: u32) -> SearchHit {
    SearchHit {
        id: chunk.id,
        source: chunk.source,
        chunk_index: chunk.chunk_index,
        content: chunk.content,
        metadata: chunk.metadata,
        rank,
        bm25_rank: None,
        vec_rank: Some(rank),
        rrf_score: None,
        rerank_score: None,
    }
}

fn renumber(hits: &mut [SearchHit]) {
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i as u32 + 1;
    }
}

fn non_empty(query: &str) -> Result<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyQuery);
    }
    Ok(trimmed.to_string())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

fn flatten_join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    res.map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KeepLoaded, ModelSlotConfig};
    use crate::manager::ModelManager;
    use crate::models::{Embedder, ModelFactory, ModelInstance, Reranker};
    use crate::store::ChunkInsert;
    use std::sync::Arc;

    struct FakeEmbedder {
        dimension: usize,
        query_vector: Vec<f32>,
    }

    impl Embedder for FakeEmbedder {
        fn dimension(&self) -> usize {
            self.dimension
        }
        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.query_vector.clone()).collect())
        }
    }

    /// Scores documents by how early the word "gold" appears.
    struct FakeReranker;

    impl Reranker for FakeReranker {
        fn score_pairs(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            Ok(documents
                .iter()
                .map(|d| if d.contains("gold") { 10.0 } else { 1.0 })
                .collect())
        }
    }

    struct FakeFactory {
        query_vector: Vec<f32>,
    }

    impl ModelFactory for FakeFactory {
        fn load(&self, slot: &str, _config: &ModelSlotConfig) -> Result<ModelInstance> {
            match slot {
                "embedder" => Ok(ModelInstance::Embedder(Arc::new(FakeEmbedder {
                    dimension: self.query_vector.len(),
                    query_vector: self.query_vector.clone(),
                }))),
                "reranker" => Ok(ModelInstance::Reranker(Arc::new(FakeReranker))),
                other => Err(Error::UnknownSlot(other.to_string())),
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.models.insert(
            "embedder".to_string(),
            ModelSlotConfig {
                name: "fake/embedder".to_string(),
                keep_loaded: KeepLoaded::OnDemand,
                idle_timeout_seconds: 0,
                memory_estimate_mb: 10,
            },
        );
        config.models.insert(
            "reranker".to_string(),
            ModelSlotConfig {
                name: "fake/reranker".to_string(),
                keep_loaded: KeepLoaded::OnDemand,
                idle_timeout_seconds: 0,
                memory_estimate_mb: 10,
            },
        );
        config
    }

    fn engine_with_query_vector(v: Vec<f32>) -> SearchEngine {
        let manager = ModelManager::new(&test_config(), Arc::new(FakeFactory { query_vector: v }));
        SearchEngine::new(manager)
    }

    fn seed_store(path: &std::path::Path) {
        let mut store = crate::store::SearchStore::create(path, 2).unwrap();
        store
            .insert_batch(&[
                ChunkInsert {
                    source: "a.md".into(),
                    chunk_index: 0,
                    content: "rust async runtime tokio".into(),
                    embedding: vec![1.0, 0.0],
                    metadata: HashMap::new(),
                },
                ChunkInsert {
                    source: "b.md".into(),
                    chunk_index: 0,
                    content: "rust gold standard library".into(),
                    embedding: vec![0.9, 0.1],
                    metadata: HashMap::new(),
                },
                ChunkInsert {
                    source: "c.md".into(),
                    chunk_index: 0,
                    content: "python interpreter notes".into(),
                    embedding: vec![0.0, 1.0],
                    metadata: HashMap::new(),
                },
            ])
            .unwrap();
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        let err = engine
            .search(&tmp.path().join("db"), "   ", SearchMode::Hybrid, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyQuery));
    }

    #[tokio::test]
    async fn bm25_mode_ranks_lexically() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("fastsearch.db");
        seed_store(&db);

        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        let hits = engine
            .search(&db, "tokio", SearchMode::Bm25, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "a.md");
        assert_eq!(hits[0].bm25_rank, Some(1));
        assert!(hits[0].vec_rank.is_none());
    }

    #[tokio::test]
    async fn vector_mode_ranks_by_distance() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("fastsearch.db");
        seed_store(&db);

        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        let hits = engine
            .search(&db, "anything", SearchMode::Vector, 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "a.md");
        assert_eq!(hits[1].source, "b.md");
        assert_eq!(hits[0].vec_rank, Some(1));
    }

    #[tokio::test]
    async fn hybrid_favors_documents_in_both_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("fastsearch.db");
        seed_store(&db);

        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        // "rust" matches a.md and b.md lexically; the query vector points
        // at a.md, so a.md leads both lists.
        let hits = engine
            .search(&db, "rust", SearchMode::Hybrid, 3)
            .await
            .unwrap();
        assert_eq!(hits[0].source, "a.md");
        assert!(hits[0].bm25_rank.is_some());
        assert!(hits[0].vec_rank.is_some());
        assert!(hits[0].rrf_score.unwrap() > hits[1].rrf_score.unwrap());
        assert_eq!(hits[0].rank, 1);
    }

    #[tokio::test]
    async fn reranked_mode_reorders_by_reranker_score() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("fastsearch.db");
        seed_store(&db);

        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        let hits = engine.hybrid_reranked(&db, "rust", 2, 10).await.unwrap();
        // FakeReranker boosts the "gold" document over the RRF leader.
        assert_eq!(hits[0].source, "b.md");
        assert!(hits[0].rerank_score.unwrap() > hits[1].rerank_score.unwrap());
        assert_eq!(hits[0].rank, 1);
        assert_eq!(hits[1].rank, 2);
    }

    #[tokio::test]
    async fn missing_store_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_query_vector(vec![1.0, 0.0]);
        let err = engine
            .search(&tmp.path().join("absent.db"), "x", SearchMode::Bm25, 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StoreUnavailable");
    }

    #[tokio::test]
    async fn slow_model_load_times_out_as_busy() {
        struct SlowFactory;
        impl ModelFactory for SlowFactory {
            fn load(&self, _slot: &str, _config: &ModelSlotConfig) -> Result<ModelInstance> {
                std::thread::sleep(std::time::Duration::from_millis(500));
                Ok(ModelInstance::Embedder(Arc::new(FakeEmbedder {
                    dimension: 2,
                    query_vector: vec![1.0, 0.0],
                })))
            }
        }

        let manager = ModelManager::new(&test_config(), Arc::new(SlowFactory));
        let engine =
            SearchEngine::new(manager).with_acquire_timeout(Duration::from_millis(20));
        let err = engine
            .embed_texts(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DaemonBusy(_)));
    }
}
