//! Candle backends - pure Rust, no native dependencies.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Embedding, Linear, VarBuilder};
use candle_transformers::models::debertav2::{
    Config as DebertaV2Config, DTYPE, DebertaV2SeqClassificationModel,
};
use perturb_core::{AdapterError, Result};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backend::{Capabilities, LossTarget, ModelMode, ModelOutput, QueryModel};
use crate::encoding::{ATTENTION_MASK, EncodedBatch, INPUT_IDS, TOKEN_TYPE_IDS};

pub(crate) fn field_tensor(batch: &EncodedBatch, name: &str, device: &Device) -> Result<Option<Tensor>> {
    let Some((flat, shape)) = batch.flat(name) else {
        return Ok(None);
    };
    Ok(Some(Tensor::from_vec(flat, shape, device)?))
}

pub(crate) fn input_ids(batch: &EncodedBatch, device: &Device) -> Result<Tensor> {
    field_tensor(batch, INPUT_IDS, device)?.ok_or_else(|| {
        AdapterError::EncodingMismatch("batch has no `input_ids` field".into()).into()
    })
}

/// `attention_mask` from the batch, or all ones when the tokenizer gave none.
pub(crate) fn attention_mask(batch: &EncodedBatch, ids: &Tensor, device: &Device) -> Result<Tensor> {
    match field_tensor(batch, ATTENTION_MASK, device)? {
        Some(mask) => Ok(mask),
        None => Ok(ids.ones_like()?),
    }
}

/// `config.json` of an [`EmbeddingBagClassifier`].
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingBagConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_labels: usize,
}

/// Word embeddings, masked mean pooling and a linear classification head.
pub struct EmbeddingBagClassifier {
    name: String,
    embeddings: Embedding,
    classifier: Linear,
    device: Device,
    mode: ModelMode,
    embedding_trainable: bool,
}

impl EmbeddingBagClassifier {
    /// # Errors
    ///
    /// Returns an error if the safetensors weights or config cannot be loaded.
    ///
    /// # Safety
    ///
    /// Uses memory-mapped safetensors via `VarBuilder::from_mmaped_safetensors`.
    pub fn load(safetensors_path: &Path, config_path: &Path) -> Result<Self> {
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(config_path)?;
        let config: EmbeddingBagConfig = serde_json::from_str(&config_str)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[safetensors_path], DType::F32, &device)?
        };
        let name = config_path
            .parent()
            .and_then(Path::file_name)
            .map_or_else(|| "embedding-bag".to_string(), |n| n.to_string_lossy().into_owned());
        Self::from_var_builder(name, &config, &vb)
    }

    /// Build from already-resolved weights (`embeddings.weight`,
    /// `classifier.weight`, `classifier.bias`).
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or has the wrong shape.
    pub fn from_var_builder(
        name: impl Into<String>,
        config: &EmbeddingBagConfig,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let embeddings =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embeddings"))?;
        let classifier =
            candle_nn::linear(config.hidden_size, config.num_labels, vb.pp("classifier"))?;
        let name = name.into();
        debug!(
            name,
            vocab = config.vocab_size,
            hidden = config.hidden_size,
            labels = config.num_labels,
            "embedding-bag classifier loaded"
        );
        Ok(Self {
            name,
            embeddings,
            classifier,
            device: vb.device().clone(),
            mode: ModelMode::Eval,
            embedding_trainable: false,
        })
    }

    fn head(&self, embedded: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1f32)?;
        let pooled = summed.broadcast_div(&counts)?;
        Ok(self.classifier.forward(&pooled)?)
    }

    fn scores(&self, batch: &EncodedBatch) -> Result<Vec<Vec<f32>>> {
        let ids = input_ids(batch, &self.device)?;
        let mask = attention_mask(batch, &ids, &self.device)?;
        let embedded = self.embeddings.forward(&ids)?;
        Ok(self.head(&embedded, &mask)?.to_vec2()?)
    }
}

impl QueryModel for EmbeddingBagClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CLASSIFIER
    }

    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput> {
        Ok(ModelOutput::Scores(self.scores(batch)?))
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn embedding_trainable(&self) -> bool {
        self.embedding_trainable
    }

    fn set_embedding_trainable(&mut self, trainable: bool) {
        self.embedding_trainable = trainable;
    }

    fn embedding_gradient(
        &mut self,
        batch: &EncodedBatch,
        target: &LossTarget,
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        let labels = class_labels(&self.name, self.embedding_trainable, target)?;
        let ids = input_ids(batch, &self.device)?;
        let mask = attention_mask(batch, &ids, &self.device)?;
        let embedded = self.embeddings.forward(&ids)?;
        embedding_output_gradient(&embedded, labels, |embedded| self.head(embedded, &mask))
    }
}

/// Pseudo-labels of a classification target, for a model whose embedding
/// layer has been made trainable.
pub(crate) fn class_labels<'t>(
    model: &str,
    embedding_trainable: bool,
    target: &'t LossTarget,
) -> Result<&'t [u32]> {
    let LossTarget::Classes(labels) = target else {
        return Err(AdapterError::IncompatibleModel {
            model: model.to_string(),
        }
        .into());
    };
    if !embedding_trainable {
        return Err(eyre::eyre!("embedding layer of {model} is frozen"));
    }
    Ok(labels.as_slice())
}

/// Gradient of the cross-entropy of `head(embedded)` against `labels` with
/// respect to `embedded`, shaped `[batch, seq_len, dim]`.
pub(crate) fn embedding_output_gradient(
    embedded: &Tensor,
    labels: &[u32],
    head: impl FnOnce(&Tensor) -> Result<Tensor>,
) -> Result<Vec<Vec<Vec<f32>>>> {
    // Detached copy of the embedding output; its gradient is what would
    // flow into the embedding layer.
    let embedded = Var::from_tensor(embedded)?;
    let logits = head(embedded.as_tensor())?;
    let labels = Tensor::new(labels, logits.device())?;
    let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
    let loss_value = loss.to_scalar::<f32>()?;
    trace!(loss = loss_value, "classification loss");

    let grads = loss.backward()?;
    let grad = grads
        .get(embedded.as_tensor())
        .ok_or_else(|| eyre::eyre!("no gradient reached the embedding layer"))?;
    Ok(grad.to_vec3()?)
}

/// `DeBERTa` v2/v3 sequence classifier, prediction only. Candle's encoder
/// normalizes with a layer-norm kernel that has no backward pass, so no
/// gradient reaches its embeddings.
pub struct DebertaClassifier {
    name: String,
    model: DebertaV2SeqClassificationModel,
    device: Device,
    mode: ModelMode,
    embedding_trainable: bool,
}

impl DebertaClassifier {
    /// # Errors
    ///
    /// Returns an error if the safetensors model or config cannot be loaded.
    ///
    /// # Safety
    ///
    /// Uses memory-mapped safetensors via `VarBuilder::from_mmaped_safetensors`.
    pub fn load(name: impl Into<String>, safetensors_path: &Path, config_path: &Path) -> Result<Self> {
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(config_path)?;
        let config: DebertaV2Config = serde_json::from_str(&config_str)?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors_path], DTYPE, &device)? };
        let vb = vb.set_prefix("deberta");

        let id2label = config.id2label.clone();
        let model = DebertaV2SeqClassificationModel::load(vb, &config, id2label)?;

        Ok(Self {
            name: name.into(),
            model,
            device,
            mode: ModelMode::Eval,
            embedding_trainable: false,
        })
    }
}

impl QueryModel for DebertaClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INFERENCE_ONLY
    }

    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput> {
        let ids = input_ids(batch, &self.device)?;
        let mask = attention_mask(batch, &ids, &self.device)?;
        let token_type_ids = match field_tensor(batch, TOKEN_TYPE_IDS, &self.device)? {
            Some(t) => t,
            None => ids.zeros_like()?,
        };

        let logits = self
            .model
            .forward(&ids, Some(token_type_ids), Some(mask))?;
        Ok(ModelOutput::Scores(logits.to_vec2()?))
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn embedding_trainable(&self) -> bool {
        self.embedding_trainable
    }

    fn set_embedding_trainable(&mut self, trainable: bool) {
        self.embedding_trainable = trainable;
    }
}
