//! Local sentence embeddings for semantic memory.
//!
//! Facts, group memories, and episode summaries are embedded with
//! `all-MiniLM-L6-v2` (384-dim) running under ONNX Runtime, entirely on
//! the host. The model files come from HuggingFace Hub on first run and
//! are cached by `hf-hub` after that.
//!
//! Per text the pipeline is: tokenize, run the ONNX session, mean-pool
//! the token vectors under the attention mask, L2-normalize. The unit
//! vectors feed sqlite-vec KNN retrieval and the fact-merge similarity
//! check. When the engine is unavailable the memory system still works,
//! falling back to recency and importance only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Tensor;
use tracing::info;

use crate::error::{BanterError, Result};

/// HuggingFace repo the model files come from.
const MODEL_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// ONNX model filename inside the repo.
const MODEL_FILE: &str = "onnx/model.onnx";

/// Tokenizer filename inside the repo.
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Output embedding dimensions.
pub const EMBEDDING_DIM: usize = 384;

/// Maximum token sequence length fed to the model.
const MAX_TOKENS: usize = 256;

/// Tokenizer output widened to the i64 tensors the model wants.
struct TokenizedInput {
    ids: Vec<i64>,
    mask: Vec<i64>,
    type_ids: Vec<i64>,
}

/// MiniLM inference wrapper: one session, one tokenizer.
///
/// `embed` takes `&mut self` because the ONNX session does. For shared
/// concurrent use see [`SharedEmbedder`].
pub struct EmbeddingEngine {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("dim", &EMBEDDING_DIM)
            .finish_non_exhaustive()
    }
}

impl EmbeddingEngine {
    /// Load the engine from files already on disk. `model_path` is the
    /// ONNX model, `tokenizer_path` the `tokenizer.json` next to it.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be loaded.
    pub fn new(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        info!(model = %model_path.display(), "loading embedding model");
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| BanterError::Embedding(format!("model load failed: {e}")))?;

        let mut tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
            .map_err(|e| BanterError::Embedding(format!("tokenizer load failed: {e}")))?;
        // Cap sequence length; raw chat transcripts can run long.
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| BanterError::Embedding(format!("truncation config failed: {e}")))?;
        // Single-text encoding, no padding needed.
        tokenizer.with_padding(None);

        info!(dim = EMBEDDING_DIM, "embedding engine ready");
        Ok(Self { session, tokenizer })
    }

    /// Embed one text into a unit-length 384-dim vector.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let input = self.tokenize(text)?;
        self.run_inference(&input)
    }

    fn tokenize(&mut self, text: &str) -> Result<TokenizedInput> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| BanterError::Embedding(format!("tokenization failed: {e}")))?;
        let widen = |values: &[u32]| values.iter().map(|&v| i64::from(v)).collect::<Vec<i64>>();
        Ok(TokenizedInput {
            ids: widen(encoding.get_ids()),
            mask: widen(encoding.get_attention_mask()),
            type_ids: widen(encoding.get_type_ids()),
        })
    }

    fn run_inference(&mut self, input: &TokenizedInput) -> Result<Vec<f32>> {
        let seq_len = input.ids.len();
        let mut feed: HashMap<String, SessionInputValue> = HashMap::new();
        feed.insert(
            "input_ids".to_owned(),
            input_tensor(&input.ids, seq_len, "input_ids")?.into(),
        );
        feed.insert(
            "attention_mask".to_owned(),
            input_tensor(&input.mask, seq_len, "attention_mask")?.into(),
        );
        feed.insert(
            "token_type_ids".to_owned(),
            input_tensor(&input.type_ids, seq_len, "token_type_ids")?.into(),
        );

        let outputs = self
            .session
            .run(SessionInputs::from(feed))
            .map_err(|e| BanterError::Embedding(format!("ONNX inference failed: {e}")))?;

        // Token-level output, shape [1, seq_len, 384].
        let (_shape, data) = outputs[0_usize]
            .try_extract_tensor::<f32>()
            .map_err(|e| BanterError::Embedding(format!("output extraction failed: {e}")))?;

        let mut pooled = masked_mean(data, &input.mask, EMBEDDING_DIM);
        normalize_in_place(&mut pooled);
        Ok(pooled)
    }

    /// Fetch the model files from HuggingFace Hub, returning
    /// `(model_path, tokenizer_path)`. Cached by `hf-hub` after the first
    /// call.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails.
    pub fn download_model() -> Result<(PathBuf, PathBuf)> {
        info!(repo = MODEL_REPO, "fetching embedding model");
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| BanterError::Embedding(format!("HF Hub API init failed: {e}")))?;
        let repo = api.model(MODEL_REPO.to_owned());
        let fetch = |file: &str| {
            repo.get(file)
                .map_err(|e| BanterError::Embedding(format!("download of {file} failed: {e}")))
        };
        Ok((fetch(MODEL_FILE)?, fetch(TOKENIZER_FILE)?))
    }

    /// Download (cached) and load in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if download or loading fails.
    pub fn download_and_load() -> Result<Self> {
        let (model_path, tokenizer_path) = Self::download_model()?;
        Self::new(&model_path, &tokenizer_path)
    }
}

/// Shared async-friendly handle to the embedding engine.
///
/// Inference is CPU-bound and needs `&mut` on the engine, so calls are
/// serialized behind a mutex and run on the blocking pool.
#[derive(Clone, Debug)]
pub struct SharedEmbedder {
    inner: Arc<Mutex<EmbeddingEngine>>,
}

impl SharedEmbedder {
    /// Wrap an already-loaded engine.
    #[must_use]
    pub fn new(engine: EmbeddingEngine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Download (cached) and load the model off the async runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if download or loading fails.
    pub async fn bootstrap() -> Result<Self> {
        let engine = tokio::task::spawn_blocking(EmbeddingEngine::download_and_load)
            .await
            .map_err(|e| BanterError::Embedding(format!("bootstrap task failed: {e}")))??;
        Ok(Self::new(engine))
    }

    /// Embed a text string on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine lock is poisoned or inference fails.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut engine = inner
                .lock()
                .map_err(|e| BanterError::Embedding(format!("engine lock poisoned: {e}")))?;
            engine.embed(&text)
        })
        .await
        .map_err(|e| BanterError::Embedding(format!("embed task failed: {e}")))?
    }
}

fn input_tensor(values: &[i64], seq_len: usize, name: &str) -> Result<Tensor<i64>> {
    Tensor::from_array(([1, seq_len], values.to_vec()))
        .map_err(|e| BanterError::Embedding(format!("{name} tensor failed: {e}")))
}

/// Mean over the token rows whose attention bit is set.
///
/// `flat` is the `[mask.len(), dim]` token output, row-major.
fn masked_mean(flat: &[f32], mask: &[i64], dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; dim];
    let mut active = 0.0f32;
    for (row, &bit) in flat.chunks_exact(dim).zip(mask) {
        if bit == 0 {
            continue;
        }
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value;
        }
        active += 1.0;
    }
    if active > 0.0 {
        for acc in &mut pooled {
            *acc /= active;
        }
    }
    pooled
}

/// Scale to unit length. Zero vectors are left untouched.
fn normalize_in_place(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-12 {
        return;
    }
    for x in vec.iter_mut() {
        *x /= norm;
    }
}

/// Cosine similarity between two equal-length vectors, in `[-1.0, 1.0]`.
///
/// This is the comparison behind fact merging: a new fact scoring above
/// the configured threshold against an existing one updates it in place
/// instead of piling up a near-duplicate.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut mag_a = 0.0f32;
    let mut mag_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    let denom = (mag_a * mag_b).sqrt();
    if denom < 1e-12 {
        return 0.0;
    }
    dot / denom
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn masked_mean_skips_inactive_rows() {
        // Three tokens of dim 2; the third is padding.
        let flat = vec![2.0, 4.0, 6.0, 8.0, 123.0, 123.0];
        let mask = vec![1i64, 1, 0];
        assert_eq!(masked_mean(&flat, &mask, 2), vec![4.0, 6.0]);
    }

    #[test]
    fn masked_mean_of_nothing_is_zero() {
        let pooled = masked_mean(&[1.0, 1.0], &[0], 2);
        assert_eq!(pooled, vec![0.0, 0.0]);
    }

    #[test]
    fn normalization_produces_unit_length() {
        let mut v = vec![6.0, 8.0];
        normalize_in_place(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_survives_normalization() {
        let mut v = vec![0.0; 4];
        normalize_in_place(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn cosine_of_identical_and_orthogonal_vectors() {
        let a = vec![0.0, 3.0, 0.0];
        let b = vec![5.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_against_a_zero_vector_is_zero() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).abs() < 1e-6);
    }

    // -- Tests below need the real model (network + ~23 MB download) --

    #[test]
    #[ignore]
    fn downloaded_model_embeds_at_the_right_dim() {
        let mut engine = EmbeddingEngine::download_and_load().expect("download and load");
        let vec = engine.embed("hello world").expect("embed");
        assert_eq!(vec.len(), EMBEDDING_DIM);
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "expected unit norm, got {norm}");
    }

    #[test]
    #[ignore]
    fn similar_facts_score_above_merge_threshold() {
        let mut engine = EmbeddingEngine::download_and_load().expect("engine");
        let a = engine.embed("likes pizza").expect("embed a");
        let b = engine.embed("loves pepperoni pizza").expect("embed b");
        let sim = cosine_similarity(&a, &b);
        assert!(sim > 0.7, "near-duplicate facts should score high, got {sim}");
    }

    #[tokio::test]
    #[ignore]
    async fn shared_embedder_serves_concurrent_calls() {
        let embedder = SharedEmbedder::bootstrap().await.expect("bootstrap");
        let a = embedder.clone();
        let b = embedder.clone();
        let (ra, rb) = tokio::join!(a.embed("first text"), b.embed("second text"));
        assert_eq!(ra.expect("embed a").len(), EMBEDDING_DIM);
        assert_eq!(rb.expect("embed b").len(), EMBEDDING_DIM);
    }
}
