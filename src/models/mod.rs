mod fastembed_models;

pub use fastembed_models::FastEmbedFactory;

use std::sync::Arc;

use crate::config::ModelSlotConfig;
use crate::error::Result;

/// Canonical slot name for the text embedder.
pub const EMBEDDER_SLOT: &str = "embedder";

/// Canonical slot name for the cross-encoder reranker.
pub const RERANKER_SLOT: &str = "reranker";

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Produces fixed-dimension dense vectors for text.
///
/// Inference is blocking; callers on the async path wrap invocations in
/// `spawn_blocking`.
pub trait Embedder: Send + Sync {
    /// Dimensionality of the vectors produced by [`Self::embed_batch`].
    fn dimension(&self) -> usize;

    /// Compute one embedding per input text.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scores (query, document) pairs jointly; higher is more relevant.
pub trait Reranker: Send + Sync {
    /// One relevance score per document.
    fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// Instances and factories
// ---------------------------------------------------------------------------

/// A loaded model held by a manager slot.
#[derive(Clone)]
pub enum ModelInstance {
    Embedder(Arc<dyn Embedder>),
    Reranker(Arc<dyn Reranker>),
}

impl ModelInstance {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelInstance::Embedder(_) => "embedder",
            ModelInstance::Reranker(_) => "reranker",
        }
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelInstance").field(&self.kind()).finish()
    }
}

/// Constructs model instances for named slots.
///
/// The daemon wires a [`FastEmbedFactory`]; tests inject counting fakes to
/// exercise manager lifecycle behavior without model downloads.
pub trait ModelFactory: Send + Sync + 'static {
    fn load(&self, slot: &str, config: &ModelSlotConfig) -> Result<ModelInstance>;
}
