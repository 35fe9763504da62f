use perturb_core::{AdapterError, Result};

use crate::encoding::EncodedBatch;

/// Operations a model declares support for.
///
/// Loss computation for gradients is dispatched on these flags rather than on
/// the model family's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Accepts class labels and returns a classification loss.
    pub classification_loss: bool,
    /// Generates its own label sequence and returns a sequence loss.
    pub generation_loss: bool,
    /// Exposes gradients at the input-embedding layer.
    pub gradient: bool,
}

impl Capabilities {
    pub const CLASSIFIER: Self = Self {
        classification_loss: true,
        generation_loss: false,
        gradient: true,
    };

    pub const SEQ2SEQ: Self = Self {
        classification_loss: false,
        generation_loss: true,
        gradient: true,
    };

    /// Text in, text out. Nothing to differentiate against.
    pub const TEXT_TO_TEXT: Self = Self {
        classification_loss: false,
        generation_loss: false,
        gradient: false,
    };

    /// A classification head served by a backend without autograd.
    pub const INFERENCE_ONLY: Self = Self {
        classification_loss: true,
        generation_loss: false,
        gradient: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelMode {
    Train,
    #[default]
    Eval,
}

/// One row per input example.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    /// Classifier score vectors.
    Scores(Vec<Vec<f32>>),
    /// Text-to-text outputs, returned unmodified.
    Text(Vec<String>),
}

impl Default for ModelOutput {
    fn default() -> Self {
        Self::Scores(Vec::new())
    }
}

impl ModelOutput {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Scores(rows) => rows.len(),
            Self::Text(rows) => rows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_scores(&self) -> Option<&[Vec<f32>]> {
        match self {
            Self::Scores(rows) => Some(rows),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&[String]> {
        match self {
            Self::Text(rows) => Some(rows),
            Self::Scores(_) => None,
        }
    }

    /// Append the rows of a later sub-batch.
    ///
    /// # Errors
    ///
    /// Returns an error if `other` holds a different kind of output.
    pub fn append(&mut self, other: Self) -> Result<()> {
        match (self, other) {
            (Self::Scores(acc), Self::Scores(rows)) => acc.extend(rows),
            (Self::Text(acc), Self::Text(rows)) => acc.extend(rows),
            _ => return Err(eyre::eyre!("model output kind changed between sub-batches")),
        }
        Ok(())
    }
}

/// Labels the loss is computed against when no ground truth exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossTarget {
    /// Pseudo-labels: the argmax of the model's own prediction per example.
    Classes(Vec<u32>),
    /// Label sequences generated by the model from its own output.
    Sequences(Vec<Vec<u32>>),
}

/// A pretrained model the adapter can query.
///
/// Mode and embedding trainability are the only state the adapter mutates,
/// and only for the duration of a [`crate::gradient::GradientSession`].
pub trait QueryModel {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Run inference on one collated sub-batch.
    ///
    /// # Errors
    ///
    /// Inference failures propagate unmodified.
    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput>;

    /// Raw classifier scores for a batch holding only `input_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails or the model produces text.
    fn logits(&mut self, batch: &EncodedBatch) -> Result<Vec<Vec<f32>>> {
        match self.forward(batch)? {
            ModelOutput::Scores(rows) => Ok(rows),
            ModelOutput::Text(_) => Err(AdapterError::UnsupportedOperation {
                operation: "logits",
                model: self.name().to_string(),
            }
            .into()),
        }
    }

    fn mode(&self) -> ModelMode;

    fn set_mode(&mut self, mode: ModelMode);

    fn embedding_trainable(&self) -> bool;

    fn set_embedding_trainable(&mut self, trainable: bool);

    /// Generate label sequences from the model's own output.
    ///
    /// # Errors
    ///
    /// Models without generation support return
    /// [`AdapterError::UnsupportedOperation`].
    fn generate_labels(&mut self, batch: &EncodedBatch) -> Result<Vec<Vec<u32>>> {
        let _ = batch;
        Err(AdapterError::UnsupportedOperation {
            operation: "label generation",
            model: self.name().to_string(),
        }
        .into())
    }

    /// Compute the loss against `target`, back-propagate, and return the
    /// gradient that reached the input-embedding layer's output: one
    /// `[seq_len][embedding_dim]` matrix per example.
    ///
    /// # Errors
    ///
    /// Models without autograd return [`AdapterError::UnsupportedOperation`];
    /// models that cannot take `target` as labels return
    /// [`AdapterError::IncompatibleModel`].
    fn embedding_gradient(
        &mut self,
        batch: &EncodedBatch,
        target: &LossTarget,
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        let _ = (batch, target);
        Err(AdapterError::UnsupportedOperation {
            operation: "embedding gradients",
            model: self.name().to_string(),
        }
        .into())
    }
}

/// Index of the highest score in each row. Empty rows map to class 0.
#[must_use]
pub fn argmax_rows(rows: &[Vec<f32>]) -> Vec<u32> {
    rows.iter()
        .map(|row| {
            let mut best = 0usize;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            u32::try_from(best).unwrap_or(u32::MAX)
        })
        .collect()
}

/// Softmax over a logit vector.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
