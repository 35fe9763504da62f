//! BERT sequence classifier built from differentiable candle ops.
//!
//! Loads `BertForSequenceClassification` checkpoints (`bert.*` and
//! `classifier.*` tensors). Layer norm and softmax are composed from basic
//! tensor ops so that the loss can be differentiated back to the word
//! embedding output.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use perturb_core::{AdapterError, Result};
use serde::Deserialize;
use tracing::debug;

use crate::backend::{Capabilities, LossTarget, ModelMode, ModelOutput, QueryModel};
use crate::candle::{
    attention_mask, class_labels, embedding_output_gradient, field_tensor, input_ids,
};
use crate::encoding::{EncodedBatch, TOKEN_TYPE_IDS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    #[default]
    Gelu,
    #[serde(rename = "gelu_new")]
    GeluNew,
    Relu,
}

impl HiddenAct {
    fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::GeluNew => xs.gelu(),
            Self::Relu => xs.relu(),
        }
    }
}

/// The `config.json` fields a BERT classifier needs.
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub id2label: Option<HashMap<String, String>>,
}

const fn default_type_vocab_size() -> usize {
    2
}

const fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    /// Number of classes; checkpoints without `id2label` are binary.
    #[must_use]
    pub fn num_labels(&self) -> usize {
        self.id2label.as_ref().map_or(2, HashMap::len)
    }

    fn head_dim(&self) -> Result<usize> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(AdapterError::Configuration(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            ))
            .into());
        }
        Ok(self.hidden_size / self.num_attention_heads)
    }
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f32,
}

impl LayerNorm {
    #[allow(clippy::cast_possible_truncation)]
    fn load(size: usize, eps: f64, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            bias: vb.get(size, "bias")?,
            eps: eps as f32,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::layer_norm_slow(xs, &self.weight, &self.bias, self.eps)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    norm: LayerNorm,
    heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(config: &BertConfig, vb: &VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let attention = vb.pp("self");
        let output = vb.pp("output");
        Ok(Self {
            query: candle_nn::linear(h, h, attention.pp("query"))?,
            key: candle_nn::linear(h, h, attention.pp("key"))?,
            value: candle_nn::linear(h, h, attention.pp("value"))?,
            output: candle_nn::linear(h, h, output.pp("dense"))?,
            norm: LayerNorm::load(h, config.layer_norm_eps, &output.pp("LayerNorm"))?,
            heads: config.num_attention_heads,
            head_dim: config.head_dim()?,
        })
    }

    /// `[batch, seq, hidden]` to `[batch, heads, seq, head_dim]`.
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    #[allow(clippy::cast_precision_loss)]
    fn forward(&self, hidden: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, size) = hidden.dims3()?;
        let query = self.split_heads(&self.query.forward(hidden)?)?;
        let key = self.split_heads(&self.key.forward(hidden)?)?;
        let value = self.split_heads(&self.value.forward(hidden)?)?;

        let scores = (query.matmul(&key.t()?)? / (self.head_dim as f64).sqrt())?;
        let probs = candle_nn::ops::softmax(&scores.broadcast_add(mask_bias)?, D::Minus1)?;
        let context = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, size))?;

        let projected = self.output.forward(&context)?;
        Ok(self.norm.forward(&(projected + hidden)?)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    intermediate: Linear,
    output: Linear,
    norm: LayerNorm,
    act: HiddenAct,
}

impl EncoderLayer {
    fn load(config: &BertConfig, vb: &VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let output = vb.pp("output");
        Ok(Self {
            attention: SelfAttention::load(config, &vb.pp("attention"))?,
            intermediate: candle_nn::linear(h, i, vb.pp("intermediate").pp("dense"))?,
            output: candle_nn::linear(i, h, output.pp("dense"))?,
            norm: LayerNorm::load(h, config.layer_norm_eps, &output.pp("LayerNorm"))?,
            act: config.hidden_act,
        })
    }

    fn forward(&self, hidden: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(hidden, mask_bias)?;
        let expanded = self.act.apply(&self.intermediate.forward(&attended)?)?;
        let projected = self.output.forward(&expanded)?;
        Ok(self.norm.forward(&(projected + attended)?)?)
    }
}

/// Additive attention bias: 0 for real tokens, -10000 for padding.
fn mask_bias(mask: &Tensor) -> Result<Tensor> {
    let (batch, seq) = mask.dims2()?;
    Ok(mask
        .to_dtype(DType::F32)?
        .affine(10_000.0, -10_000.0)?
        .reshape((batch, 1, 1, seq))?)
}

pub struct BertClassifier {
    name: String,
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    embedding_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    pooler: Linear,
    classifier: Linear,
    device: Device,
    mode: ModelMode,
    embedding_trainable: bool,
}

impl BertClassifier {
    /// # Errors
    ///
    /// Returns an error if the safetensors weights or config cannot be loaded.
    ///
    /// # Safety
    ///
    /// Uses memory-mapped safetensors via `VarBuilder::from_mmaped_safetensors`.
    pub fn load(
        name: impl Into<String>,
        safetensors_path: &Path,
        config_path: &Path,
    ) -> Result<Self> {
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(config_path)?;
        let config: BertConfig = serde_json::from_str(&config_str)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[safetensors_path], DType::F32, &device)?
        };
        Self::from_var_builder(name, &config, &vb)
    }

    /// # Errors
    ///
    /// Returns an error if a tensor is missing or has the wrong shape, or the
    /// head count does not divide the hidden size.
    pub fn from_var_builder(
        name: impl Into<String>,
        config: &BertConfig,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let bert = vb.pp("bert");
        let embeddings = bert.pp("embeddings");
        let encoder = bert.pp("encoder").pp("layer");

        let layers = (0..config.num_hidden_layers)
            .map(|layer| EncoderLayer::load(config, &encoder.pp(layer)))
            .collect::<Result<Vec<_>>>()?;

        let name = name.into();
        debug!(
            name,
            layers = config.num_hidden_layers,
            hidden = h,
            labels = config.num_labels(),
            "bert classifier loaded"
        );
        Ok(Self {
            name,
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                h,
                embeddings.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                config.max_position_embeddings,
                h,
                embeddings.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                config.type_vocab_size,
                h,
                embeddings.pp("token_type_embeddings"),
            )?,
            embedding_norm: LayerNorm::load(h, config.layer_norm_eps, &embeddings.pp("LayerNorm"))?,
            layers,
            pooler: candle_nn::linear(h, h, bert.pp("pooler").pp("dense"))?,
            classifier: candle_nn::linear(h, config.num_labels(), vb.pp("classifier"))?,
            device: vb.device().clone(),
            mode: ModelMode::Eval,
            embedding_trainable: false,
        })
    }

    /// Logits for a batch whose word embeddings have already been looked up.
    fn classify(&self, word_embeds: &Tensor, batch: &EncodedBatch, ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = ids.dims2()?;
        let mask = attention_mask(batch, ids, &self.device)?;
        let token_types = match field_tensor(batch, TOKEN_TYPE_IDS, &self.device)? {
            Some(t) => t,
            None => ids.zeros_like()?,
        };
        let positions = Tensor::arange(0u32, u32::try_from(seq_len)?, &self.device)?;

        let embeddings = word_embeds
            .add(&self.token_type_embeddings.forward(&token_types)?)?
            .broadcast_add(&self.position_embeddings.forward(&positions)?)?;
        let mut hidden = self.embedding_norm.forward(&embeddings)?;

        let bias = mask_bias(&mask)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }

        let first = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&first)?.tanh()?;
        Ok(self.classifier.forward(&pooled)?)
    }
}

impl QueryModel for BertClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CLASSIFIER
    }

    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput> {
        let ids = input_ids(batch, &self.device)?;
        let word_embeds = self.word_embeddings.forward(&ids)?;
        let logits = self.classify(&word_embeds, batch, &ids)?;
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

    fn embedding_gradient(
        &mut self,
        batch: &EncodedBatch,
        target: &LossTarget,
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        let labels = class_labels(&self.name, self.embedding_trainable, target)?;
        let ids = input_ids(batch, &self.device)?;
        let word_embeds = self.word_embeddings.forward(&ids)?;
        embedding_output_gradient(&word_embeds, labels, |embedded| {
            self.classify(embedded, batch, &ids)
        })
    }
}
