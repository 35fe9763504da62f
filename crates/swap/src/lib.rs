//! Word substitution from a precomputed nearest-neighbour embedding table.

pub mod neighbor;
pub mod source;
pub mod stopwords;

use perturb_core::{Config, Result};
use tracing::{debug, info, instrument, trace};

pub use neighbor::NeighborIndex;
pub use source::{EmbeddingSource, download_if_needed};

pub const DEFAULT_MAX_CANDIDATES: usize = 10;

/// A transformation that swaps single words for proposed replacements.
pub trait WordSwap {
    /// Replacement candidates for `word`, best first.
    fn replacement_words(&self, word: &str) -> Vec<String>;

    fn replace_stopwords(&self) -> bool;

    /// Every text obtained by replacing one word of `text` with one of its
    /// candidates. Stopwords are skipped unless enabled; non-alphabetic words
    /// are always skipped.
    fn transform(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for (start, end) in word_spans(text) {
            let word = &text[start..end];
            if !word.chars().all(char::is_alphabetic) {
                continue;
            }
            if !self.replace_stopwords() && stopwords::is_stopword(word) {
                continue;
            }

            let lower = word.to_lowercase();
            for candidate in self.replacement_words(&lower) {
                if candidate == lower {
                    continue;
                }
                let replacement = match_case(word, &candidate);
                out.push(format!("{}{replacement}{}", &text[..start], &text[end..]));
            }
        }
        trace!(variants = out.len(), "text transformed");
        out
    }
}

/// Byte spans of maximal runs of alphanumeric characters and apostrophes.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        let in_word = c.is_alphanumeric() || c == '\'';
        match (in_word, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Carry a leading capital from `original` over to `candidate`.
fn match_case(original: &str, candidate: &str) -> String {
    let capitalized = original.chars().next().is_some_and(char::is_uppercase);
    if !capitalized {
        return candidate.to_string();
    }
    let mut chars = candidate.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Replaces words with their nearest neighbours in a counter-fitted
/// embedding space.
pub struct WordSwapEmbedding {
    index: NeighborIndex,
    replace_stopwords: bool,
}

impl WordSwapEmbedding {
    /// Resolve `source_name`, download its artifacts if missing, and load
    /// them. `config.max_candidates` caps every candidate request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown source, or an error if
    /// the artifacts cannot be downloaded or loaded.
    #[instrument(skip(config))]
    pub fn new(source_name: &str, config: &Config) -> Result<Self> {
        let source = EmbeddingSource::from_name(source_name)?;
        let dir = download_if_needed(config, source)?;
        let index = NeighborIndex::load(&dir, source, config.max_candidates)?;
        info!(source = source.name(), words = index.len(), "embedding neighbours loaded");
        Ok(Self::from_index(index, config.replace_stopwords))
    }

    #[must_use]
    pub const fn from_index(index: NeighborIndex, replace_stopwords: bool) -> Self {
        Self {
            index,
            replace_stopwords,
        }
    }

    #[must_use]
    pub const fn index(&self) -> &NeighborIndex {
        &self.index
    }

    /// Up to `max_candidates` neighbours of `word`, further capped by the
    /// configured maximum.
    #[must_use]
    pub fn candidates_for(&self, word: &str, max_candidates: usize) -> Vec<String> {
        let candidates = self.index.candidates_for(word, max_candidates);
        debug!(word, found = candidates.len(), "neighbour lookup");
        candidates
    }
}

impl WordSwap for WordSwapEmbedding {
    fn replacement_words(&self, word: &str) -> Vec<String> {
        self.candidates_for(word, DEFAULT_MAX_CANDIDATES)
    }

    fn replace_stopwords(&self) -> bool {
        self.replace_stopwords
    }
}
