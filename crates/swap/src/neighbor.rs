//! Precomputed nearest-neighbour table over a word-embedding space.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Tensor};
use eyre::WrapErr;
use perturb_core::Result;
use tracing::{debug, instrument};

use crate::source::EmbeddingSource;

/// Word table, embedding matrix and neighbour ranks of one embedding source.
/// Read-only once loaded.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    word_to_index: HashMap<String, usize>,
    index_to_word: HashMap<usize, String>,
    /// Row-major `[vocab, dim]`.
    embeddings: Vec<f32>,
    dim: usize,
    /// Row-major `[vocab, width]`; entry 0 of each row is the word itself.
    neighbors: Vec<usize>,
    width: usize,
    max_candidates: Option<usize>,
}

impl NeighborIndex {
    /// Assemble an index from in-memory tables.
    ///
    /// `max_candidates` caps every `candidates_for` call; `None` or `Some(0)`
    /// means no cap.
    ///
    /// # Errors
    ///
    /// Returns an error if two words share an index, or if a word index or
    /// neighbour id lies outside the matrices.
    pub fn from_parts(
        word_to_index: HashMap<String, usize>,
        embeddings: Vec<f32>,
        dim: usize,
        neighbors: Vec<usize>,
        width: usize,
        max_candidates: Option<usize>,
    ) -> Result<Self> {
        let vocab_rows = if dim == 0 { 0 } else { embeddings.len() / dim };
        let neighbor_rows = if width == 0 { 0 } else { neighbors.len() / width };

        let mut index_to_word = HashMap::with_capacity(word_to_index.len());
        for (word, &index) in &word_to_index {
            if index >= vocab_rows || index >= neighbor_rows {
                return Err(eyre::eyre!(
                    "word `{word}` has index {index}, but the embedding matrix has {vocab_rows} rows \
                     and the neighbour table {neighbor_rows}"
                ));
            }
            if let Some(other) = index_to_word.insert(index, word.clone()) {
                return Err(eyre::eyre!(
                    "words `{other}` and `{word}` both map to index {index}"
                ));
            }
        }
        if let Some(&bad) = neighbors.iter().find(|&&id| id >= vocab_rows) {
            return Err(eyre::eyre!(
                "neighbour table references id {bad} beyond vocabulary of {vocab_rows}"
            ));
        }

        Ok(Self {
            word_to_index,
            index_to_word,
            embeddings,
            dim,
            neighbors,
            width,
            max_candidates: max_candidates.filter(|&m| m > 0),
        })
    }

    /// Load the three artifacts of `source` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact cannot be read or parsed, or if the
    /// tables are inconsistent with each other.
    #[instrument(skip(dir), fields(dir = %dir.display()))]
    pub fn load(dir: &Path, source: EmbeddingSource, max_candidates: Option<usize>) -> Result<Self> {
        let artifacts = source.artifacts();

        let word_list_path = dir.join(artifacts.word_list);
        let content = std::fs::read_to_string(&word_list_path)
            .wrap_err_with(|| format!("failed to read {}", word_list_path.display()))?;
        let word_to_index: HashMap<String, usize> = serde_json::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", word_list_path.display()))?;

        let (embeddings, dim) = read_embeddings(&dir.join(artifacts.embeddings))?;
        let (neighbors, width) = read_neighbors(&dir.join(artifacts.neighbors))?;
        debug!(
            words = word_to_index.len(),
            dim,
            width,
            "embedding artifacts read"
        );

        Self::from_parts(word_to_index, embeddings, dim, neighbors, width, max_candidates)
    }

    /// Up to `max_candidates` nearest neighbours of `word`, nearest first,
    /// never including the word itself. Words outside the vocabulary have no
    /// candidates.
    #[must_use]
    pub fn candidates_for(&self, word: &str, max_candidates: usize) -> Vec<String> {
        let cap = self
            .max_candidates
            .map_or(max_candidates, |configured| max_candidates.min(configured));
        let Some(&index) = self.word_to_index.get(word) else {
            return Vec::new();
        };

        self.neighbor_row(index)
            .iter()
            .skip(1)
            .take(cap)
            .filter_map(|id| self.index_to_word.get(id).cloned())
            .collect()
    }

    fn neighbor_row(&self, index: usize) -> &[usize] {
        &self.neighbors[index * self.width..(index + 1) * self.width]
    }

    #[must_use]
    pub fn contains(&self, word: &str) -> bool {
        self.word_to_index.contains_key(word)
    }

    #[must_use]
    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.word_to_index.get(word).copied()
    }

    #[must_use]
    pub fn word_at(&self, index: usize) -> Option<&str> {
        self.index_to_word.get(&index).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.word_to_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.word_to_index.is_empty()
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn embedding(&self, word: &str) -> Option<&[f32]> {
        let index = self.index_of(word)?;
        Some(&self.embeddings[index * self.dim..(index + 1) * self.dim])
    }

    /// Cosine similarity of two words' vectors.
    #[must_use]
    pub fn cosine_similarity(&self, a: &str, b: &str) -> Option<f32> {
        let (a, b) = (self.embedding(a)?, self.embedding(b)?);
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return Some(0.0);
        }
        Some(dot / (norm_a * norm_b))
    }

    /// Mean squared distance between two words' vectors.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mse(&self, a: &str, b: &str) -> Option<f32> {
        let (a, b) = (self.embedding(a)?, self.embedding(b)?);
        if a.is_empty() {
            return Some(0.0);
        }
        let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
        Some(sum / a.len() as f32)
    }
}

fn read_npy(path: &Path) -> Result<Tensor> {
    Tensor::read_npy(path).wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn read_embeddings(path: &Path) -> Result<(Vec<f32>, usize)> {
    let tensor = read_npy(path)?;
    let (_, dim) = tensor.dims2()?;
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok((values, dim))
}

fn read_neighbors(path: &Path) -> Result<(Vec<usize>, usize)> {
    let tensor = read_npy(path)?;
    let (_, width) = tensor.dims2()?;
    let flat = tensor.flatten_all()?;
    let ids = match flat.dtype() {
        DType::I64 => flat
            .to_vec1::<i64>()?
            .into_iter()
            .map(|id| usize::try_from(id).wrap_err("negative id in neighbour table"))
            .collect::<Result<Vec<_>>>()?,
        DType::U32 => flat
            .to_vec1::<u32>()?
            .into_iter()
            .map(|id| usize::try_from(id).wrap_err("neighbour id overflows usize"))
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(eyre::eyre!(
                "{} has dtype {other:?}, expected an integer matrix",
                path.display()
            ));
        }
    };
    Ok((ids, width))
}
