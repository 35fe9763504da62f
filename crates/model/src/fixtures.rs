//! Tiny tokenizer and model weights shared by unit tests.

/// Whitespace word-level tokenizer without padding or post-processing.
pub const WORD_LEVEL: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "WhitespaceSplit" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": { "[UNK]": 0, "[PAD]": 1, "the": 2, "cat": 3, "sat": 4 },
        "unk_token": "[UNK]"
    }
}"#;

#[cfg(feature = "candle")]
pub use self::bert::{BERT_CONFIG, bert_config, bert_tensors};

#[cfg(feature = "candle")]
mod bert {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use crate::bert::BertConfig;

    /// One layer, two heads, hidden 4, two labels.
    pub const BERT_CONFIG: &str = r#"{
        "model_type": "bert",
        "vocab_size": 8,
        "hidden_size": 4,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": 8,
        "hidden_act": "gelu",
        "max_position_embeddings": 16,
        "type_vocab_size": 2,
        "layer_norm_eps": 1e-12,
        "id2label": { "0": "NEGATIVE", "1": "POSITIVE" }
    }"#;

    pub fn bert_config() -> BertConfig {
        serde_json::from_str(BERT_CONFIG).unwrap()
    }

    /// Deterministic, non-degenerate values.
    fn pattern(shape: &[usize], offset: f64) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::arange(0u32, u32::try_from(n).unwrap(), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .affine(0.37, offset)
            .unwrap()
            .sin()
            .unwrap()
            .affine(0.5, 0.0)
            .unwrap()
            .reshape(shape.to_vec())
            .unwrap()
    }

    fn norm(tensors: &mut HashMap<String, Tensor>, prefix: &str, size: usize) {
        tensors.insert(
            format!("{prefix}.weight"),
            Tensor::ones(size, DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            format!("{prefix}.bias"),
            Tensor::zeros(size, DType::F32, &Device::Cpu).unwrap(),
        );
    }

    fn dense(
        tensors: &mut HashMap<String, Tensor>,
        prefix: &str,
        (out_dim, in_dim): (usize, usize),
        offset: f64,
    ) {
        tensors.insert(format!("{prefix}.weight"), pattern(&[out_dim, in_dim], offset));
        tensors.insert(format!("{prefix}.bias"), pattern(&[out_dim], offset + 0.5));
    }

    /// `BertForSequenceClassification` tensor names for [`bert_config`].
    pub fn bert_tensors() -> HashMap<String, Tensor> {
        let config = bert_config();
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let mut tensors = HashMap::new();

        tensors.insert(
            "bert.embeddings.word_embeddings.weight".into(),
            pattern(&[config.vocab_size, h], 0.1),
        );
        tensors.insert(
            "bert.embeddings.position_embeddings.weight".into(),
            pattern(&[config.max_position_embeddings, h], 1.3),
        );
        tensors.insert(
            "bert.embeddings.token_type_embeddings.weight".into(),
            pattern(&[config.type_vocab_size, h], 2.7),
        );
        norm(&mut tensors, "bert.embeddings.LayerNorm", h);

        for layer in 0..config.num_hidden_layers {
            let prefix = format!("bert.encoder.layer.{layer}");
            dense(&mut tensors, &format!("{prefix}.attention.self.query"), (h, h), 0.2);
            dense(&mut tensors, &format!("{prefix}.attention.self.key"), (h, h), 0.9);
            dense(&mut tensors, &format!("{prefix}.attention.self.value"), (h, h), 1.7);
            dense(&mut tensors, &format!("{prefix}.attention.output.dense"), (h, h), 2.1);
            norm(&mut tensors, &format!("{prefix}.attention.output.LayerNorm"), h);
            dense(&mut tensors, &format!("{prefix}.intermediate.dense"), (i, h), 3.3);
            dense(&mut tensors, &format!("{prefix}.output.dense"), (h, i), 0.6);
            norm(&mut tensors, &format!("{prefix}.output.LayerNorm"), h);
        }

        dense(&mut tensors, "bert.pooler.dense", (h, h), 1.1);
        dense(&mut tensors, "classifier", (config.num_labels(), h), 2.4);
        tensors
    }
}
