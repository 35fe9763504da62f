//! Per-example encodings and their collation into rectangular batches.

use std::collections::BTreeMap;

use perturb_core::{AdapterError, Result};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";

/// Named token sequences for a single input, as produced by a tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    fields: BTreeMap<String, Vec<u32>>,
}

impl Encoding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, values: Vec<u32>) -> Self {
        self.fields.insert(name.into(), values);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<u32>) {
        self.fields.insert(name.into(), values);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u32]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// # Errors
    ///
    /// Returns [`AdapterError::EncodingMismatch`] if there is no `input_ids`
    /// field.
    pub fn input_ids(&self) -> Result<&[u32]> {
        self.get(INPUT_IDS).ok_or_else(|| {
            AdapterError::EncodingMismatch("encoding has no `input_ids` field".into()).into()
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Encodings of several examples grouped by field name: each field is a
/// `[batch][seq_len]` matrix with one row per example.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    fields: BTreeMap<String, Vec<Vec<u32>>>,
    len: usize,
}

impl EncodedBatch {
    /// Number of examples.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[Vec<u32>]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Row-major values of one field with its `(batch, seq_len)` shape, ready
    /// to become a tensor.
    #[must_use]
    pub fn flat(&self, name: &str) -> Option<(Vec<u32>, (usize, usize))> {
        let rows = self.fields.get(name)?;
        let seq_len = rows.first().map_or(0, Vec::len);
        let flat = rows.iter().flatten().copied().collect();
        Some((flat, (rows.len(), seq_len)))
    }
}

/// Transpose per-example mappings into one mapping of per-field matrices.
///
/// # Errors
///
/// Returns [`AdapterError::EncodingMismatch`] if examples disagree on their
/// field names, or if a field has rows of different lengths.
pub fn collate(encodings: &[Encoding]) -> Result<EncodedBatch> {
    let Some(first) = encodings.first() else {
        return Ok(EncodedBatch::default());
    };
    let expected: Vec<&str> = first.keys().collect();

    for (i, encoding) in encodings.iter().enumerate().skip(1) {
        if !encoding.keys().eq(expected.iter().copied()) {
            let found: Vec<&str> = encoding.keys().collect();
            return Err(AdapterError::EncodingMismatch(format!(
                "example {i} has fields {found:?}, expected {expected:?}"
            ))
            .into());
        }
    }

    let mut fields = BTreeMap::new();
    for key in expected {
        let rows: Vec<Vec<u32>> = encodings
            .iter()
            .map(|e| e.fields[key].clone())
            .collect();
        let width = rows[0].len();
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(AdapterError::EncodingMismatch(format!(
                "field `{key}` is ragged: example 0 has {width} values, example {i} has {}",
                row.len()
            ))
            .into());
        }
        fields.insert(key.to_string(), rows);
    }

    Ok(EncodedBatch {
        fields,
        len: encodings.len(),
    })
}

/// Collate a single field, ignoring the others.
///
/// # Errors
///
/// Same conditions as [`collate`], restricted to `name`.
pub fn collate_field(encodings: &[Encoding], name: &str) -> Result<EncodedBatch> {
    let projected = encodings
        .iter()
        .enumerate()
        .map(|(i, e)| -> Result<Encoding> {
            e.get(name)
                .map(|values| Encoding::new().with_field(name, values.to_vec()))
                .ok_or_else(|| {
                    AdapterError::EncodingMismatch(format!("example {i} has no `{name}` field"))
                        .into()
                })
        })
        .collect::<Result<Vec<_>>>()?;
    collate(&projected)
}
