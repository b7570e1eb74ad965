use std::sync::Arc;
use std::time::Instant;

use fastembed::{
    EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
};
use tracing::info;

use crate::config::ModelSlotConfig;
use crate::error::{Error, Result};
use crate::models::{Embedder, ModelFactory, ModelInstance, Reranker, EMBEDDER_SLOT, RERANKER_SLOT};

/// Loads fastembed-backed models for the canonical slots.
///
/// Model files are downloaded and cached by fastembed on first load;
/// subsequent loads come from the on-disk cache.
#[derive(Debug, Default)]
pub struct FastEmbedFactory;

impl ModelFactory for FastEmbedFactory {
    fn load(&self, slot: &str, config: &ModelSlotConfig) -> Result<ModelInstance> {
        let started = Instant::now();
        let instance = match slot {
            EMBEDDER_SLOT => {
                let (model, dimension) = embedding_model_from_name(&config.name)?;
                let text_embedding = TextEmbedding::try_new(
                    InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| Error::ModelLoadFailed {
                    slot: slot.to_string(),
                    reason: e.to_string(),
                })?;
                ModelInstance::Embedder(Arc::new(FastEmbedEmbedder {
                    model: text_embedding,
                    dimension,
                }))
            }
            RERANKER_SLOT => {
                let model = reranker_model_from_name(&config.name)?;
                let text_rerank = TextRerank::try_new(
                    RerankInitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| Error::ModelLoadFailed {
                    slot: slot.to_string(),
                    reason: e.to_string(),
                })?;
                ModelInstance::Reranker(Arc::new(FastEmbedReranker { model: text_rerank }))
            }
            other => return Err(Error::UnknownSlot(other.to_string())),
        };

        info!(
            slot,
            model = %config.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(instance)
    }
}

struct FastEmbedEmbedder {
    model: TextEmbedding,
    dimension: usize,
}

impl Embedder for FastEmbedEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::Internal(format!("embedding failed: {e}")))
    }
}

struct FastEmbedReranker {
    model: TextRerank,
}

impl Reranker for FastEmbedReranker {
    fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let results = self
            .model
            .rerank(query, documents.iter().map(|d| d.as_str()).collect(), false, None)
            .map_err(|e| Error::Internal(format!("reranking failed: {e}")))?;

        // fastembed returns results sorted by score; restore input order.
        let mut scores = vec![0.0f32; documents.len()];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score;
            }
        }
        Ok(scores)
    }
}

/// Map a configured model name to the fastembed embedding model and its
/// vector dimension.
fn embedding_model_from_name(name: &str) -> Result<(EmbeddingModel, usize)> {
    match name {
        "BAAI/bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "BAAI/bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "BAAI/bge-large-en-v1.5" => Ok((EmbeddingModel::BGELargeENV15, 1024)),
        "sentence-transformers/all-MiniLM-L6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "nomic-ai/nomic-embed-text-v1.5" => Ok((EmbeddingModel::NomicEmbedTextV15, 768)),
        other => Err(Error::Config(format!(
            "unsupported embedding model '{other}'"
        ))),
    }
}

fn reranker_model_from_name(name: &str) -> Result<RerankerModel> {
    match name {
        "BAAI/bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
        "jinaai/jina-reranker-v1-turbo-en" => Ok(RerankerModel::JINARerankerV1TurboEn),
        other => Err(Error::Config(format!(
            "unsupported reranker model '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_embedding_models_resolve() {
        let (_, dim) = embedding_model_from_name("BAAI/bge-base-en-v1.5").unwrap();
        assert_eq!(dim, 768);
        let (_, dim) = embedding_model_from_name("BAAI/bge-small-en-v1.5").unwrap();
        assert_eq!(dim, 384);
    }

    #[test]
    fn unknown_model_is_a_config_error() {
        assert!(embedding_model_from_name("acme/unknown").is_err());
        assert!(reranker_model_from_name("acme/unknown").is_err());
    }
}
