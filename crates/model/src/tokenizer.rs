//! Uniform tokenizer interface and the `tokenizers` adapter.

use std::path::Path;

use perturb_core::Result;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};
use tracing::debug;

use crate::encoding::{ATTENTION_MASK, Encoding, INPUT_IDS, TOKEN_TYPE_IDS};

const PAD_TOKENS: [&str; 2] = ["[PAD]", "<pad>"];

pub trait TextTokenizer {
    /// # Errors
    ///
    /// Returns an error if the tokenizer rejects the input.
    fn encode(&self, text: &str) -> Result<Encoding>;

    /// Encode several inputs. Tokenizers without native batch support fall
    /// back to encoding each input on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if any input is rejected.
    fn batch_encode(&self, inputs: &[&str]) -> Result<Vec<Encoding>> {
        inputs.iter().map(|text| self.encode(text)).collect()
    }

    /// Surface strings for token ids. Unknown ids map to an empty string.
    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String>;
}

/// Adapter over a raw `tokenizers::Tokenizer`. Batches are padded to their
/// longest member so that they always collate.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    /// Wrap a tokenizer, padding batches and optionally truncating to
    /// `max_length` tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation parameters are rejected.
    pub fn new(mut inner: Tokenizer, max_length: Option<usize>) -> Result<Self> {
        if inner.get_padding().is_none() {
            let padding = default_padding(&inner);
            inner.with_padding(Some(padding));
        }
        if let Some(max_length) = max_length {
            inner
                .with_truncation(Some(TruncationParams {
                    max_length,
                    ..TruncationParams::default()
                }))
                .map_err(|e| eyre::eyre!(e))?;
            debug!(max_length, "tokenizer truncation enabled");
        }
        Ok(Self { inner })
    }

    /// # Errors
    ///
    /// Returns an error if `tokenizer.json` cannot be read or parsed.
    pub fn from_file(path: &Path, max_length: Option<usize>) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| eyre::eyre!(e))?;
        debug!(path = %path.display(), "tokenizer loaded");
        Self::new(inner, max_length)
    }
}

/// Pad with the vocabulary's own pad token when it has one.
fn default_padding(tokenizer: &Tokenizer) -> PaddingParams {
    let found = PAD_TOKENS
        .iter()
        .find_map(|&token| tokenizer.token_to_id(token).map(|id| (token, id)));
    match found {
        Some((token, id)) => {
            debug!(token, id, "padding with vocabulary pad token");
            PaddingParams {
                pad_id: id,
                pad_token: token.to_string(),
                ..PaddingParams::default()
            }
        }
        None => PaddingParams::default(),
    }
}

fn to_encoding(encoding: &tokenizers::Encoding) -> Encoding {
    Encoding::new()
        .with_field(INPUT_IDS, encoding.get_ids().to_vec())
        .with_field(ATTENTION_MASK, encoding.get_attention_mask().to_vec())
        .with_field(TOKEN_TYPE_IDS, encoding.get_type_ids().to_vec())
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Encoding> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| eyre::eyre!(e))?;
        Ok(to_encoding(&encoding))
    }

    fn batch_encode(&self, inputs: &[&str]) -> Result<Vec<Encoding>> {
        let encodings = self
            .inner
            .encode_batch(inputs.to_vec(), true)
            .map_err(|e| eyre::eyre!(e))?;
        Ok(encodings.iter().map(to_encoding).collect())
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.inner.id_to_token(id).unwrap_or_default())
            .collect()
    }
}

impl TryFrom<Tokenizer> for HfTokenizer {
    type Error = eyre::Report;

    fn try_from(inner: Tokenizer) -> Result<Self> {
        Self::new(inner, None)
    }
}
