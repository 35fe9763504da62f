//! Uniform query interface over pretrained text models.
//!
//! [`ModelQueryAdapter`] wraps a model and a tokenizer and exposes batched
//! prediction, input-embedding gradients and token strings the way the model
//! actually saw them.

pub mod backend;
pub mod batch;
pub mod encoding;
pub mod gradient;
pub mod tokenizer;
pub mod tokens;

#[cfg(feature = "candle")]
pub mod bert;
#[cfg(feature = "candle")]
pub mod candle;
#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(test)]
mod fixtures;

use std::path::{Path, PathBuf};

use perturb_core::config::BackendKind;
use perturb_core::{AdapterError, Config, Result, hub};
use tracing::{debug, info, instrument, trace};

pub use backend::{Capabilities, LossTarget, ModelMode, ModelOutput, QueryModel};
pub use encoding::{EncodedBatch, Encoding};
pub use gradient::{GradientResult, GradientSession};
pub use tokenizer::{HfTokenizer, TextTokenizer};
pub use tokens::TokenizeOptions;

/// Results of [`ModelQueryAdapter::predict`], one row per input.
pub type PredictionBatch = ModelOutput;

pub struct ModelQueryAdapter {
    model: Box<dyn QueryModel>,
    tokenizer: Box<dyn TextTokenizer>,
    batch_size: usize,
}

impl ModelQueryAdapter {
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] for a zero `batch_size`.
    pub fn new(
        model: Box<dyn QueryModel>,
        tokenizer: Box<dyn TextTokenizer>,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(AdapterError::Configuration("batch_size must be at least 1".into()).into());
        }
        Ok(Self {
            model,
            tokenizer,
            batch_size,
        })
    }

    /// Wrap a raw `tokenizers::Tokenizer`, using the configured batch size and
    /// truncation length.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the tokenizer
    /// rejects its truncation settings.
    pub fn with_tokenizer(
        model: Box<dyn QueryModel>,
        tokenizer: tokenizers::Tokenizer,
        config: &Config,
    ) -> Result<Self> {
        let tokenizer = HfTokenizer::new(tokenizer, config.max_length)?;
        Self::new(model, Box::new(tokenizer), config.batch_size)
    }

    /// Download `tokenizer.json` and weights for `repo_id` from the hub and
    /// load them with the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a download fails, the backend is not compiled in,
    /// or the model cannot be loaded.
    #[instrument(skip(config), fields(backend = ?config.backend))]
    pub fn from_pretrained(repo_id: &str, config: &Config) -> Result<Self> {
        config.validate()?;
        let repo = hub::api(config)?.model(repo_id.to_string());
        Self::load(repo_id, config, |file| hub::fetch(&repo, file))
    }

    /// Load `tokenizer.json` and weights from a local model directory laid
    /// out like a hub repository.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing, the backend is not compiled in,
    /// or the model cannot be loaded.
    #[instrument(skip(dir, config), fields(dir = %dir.display(), backend = ?config.backend))]
    pub fn from_dir(dir: &Path, config: &Config) -> Result<Self> {
        config.validate()?;
        let name = dir
            .file_name()
            .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self::load(&name, config, |file| {
            let path = dir.join(file);
            if path.exists() {
                Ok(path)
            } else {
                Err(eyre::eyre!("{} not found", path.display()))
            }
        })
    }

    fn load(name: &str, config: &Config, fetch: impl Fn(&str) -> Result<PathBuf>) -> Result<Self> {
        let tokenizer_path = fetch("tokenizer.json")?;
        let tokenizer = HfTokenizer::from_file(&tokenizer_path, config.max_length)?;

        let model = match config.backend {
            BackendKind::Auto => load_auto_backend(name, &fetch)?,
            BackendKind::Candle => load_candle_backend(name, &fetch)?,
            BackendKind::Onnx => load_onnx_backend(name, &fetch)?,
        };
        info!(model = model.name(), "model loaded");

        Self::new(model, Box::new(tokenizer), config.batch_size)
    }

    #[must_use]
    pub fn model(&self) -> &dyn QueryModel {
        self.model.as_ref()
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Encode inputs, batched when the tokenizer supports it.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer rejects an input.
    pub fn encode(&self, inputs: &[&str]) -> Result<Vec<Encoding>> {
        self.tokenizer.batch_encode(inputs)
    }

    /// Query the model on `inputs`.
    ///
    /// With `return_logits` all inputs go through the model's raw logits path
    /// in a single call; otherwise inputs are split into sub-batches of
    /// `batch_size` and the outputs concatenated in input order.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::EncodingMismatch`] if encodings cannot be
    /// collated. Inference errors propagate unmodified.
    #[instrument(skip(self, inputs), fields(inputs = inputs.len(), batch_size = self.batch_size))]
    pub fn predict(&mut self, inputs: &[&str], return_logits: bool) -> Result<PredictionBatch> {
        if inputs.is_empty() {
            return Ok(PredictionBatch::default());
        }
        let encodings = self.encode(inputs)?;

        if return_logits {
            let batch = encoding::collate_field(&encodings, encoding::INPUT_IDS)?;
            let logits = self.model.logits(&batch)?;
            trace!(rows = logits.len(), "logits computed");
            return Ok(ModelOutput::Scores(logits));
        }

        let model = self.model.as_mut();
        let output = batch::batch_model_predict(&encodings, self.batch_size, |batch| {
            model.forward(batch)
        })?;
        debug!(rows = output.len(), "prediction complete");
        Ok(output)
    }

    /// Gradient of the model's loss with respect to the input-embedding
    /// layer's output for `text`.
    ///
    /// No ground-truth label exists here: classifiers are scored against their
    /// own argmax prediction, generation models against a label sequence they
    /// generate themselves. Model mode and embedding trainability are restored
    /// before returning, on success or failure.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::UnsupportedOperation`] if the model has no gradient
    ///   support (text-to-text models).
    /// - [`AdapterError::IncompatibleModel`] if the model cannot compute a
    ///   loss from labels.
    /// - Any error raised by the forward or backward pass.
    #[instrument(skip(self, text), fields(model = self.model.name(), text_len = text.len()))]
    pub fn get_gradient(&mut self, text: &str) -> Result<GradientResult> {
        let capabilities = self.model.capabilities();
        if !capabilities.gradient {
            return Err(AdapterError::UnsupportedOperation {
                operation: "get_gradient",
                model: self.model.name().to_string(),
            }
            .into());
        }
        if !capabilities.classification_loss && !capabilities.generation_loss {
            return Err(AdapterError::IncompatibleModel {
                model: self.model.name().to_string(),
            }
            .into());
        }

        let encodings = self.encode(&[text])?;
        let ids = encodings
            .first()
            .ok_or_else(|| eyre::eyre!("tokenizer returned no encoding"))?
            .input_ids()?
            .to_vec();
        let batch = encoding::collate(&encodings)?;

        let mut session = GradientSession::enter(self.model.as_mut());
        let target = if capabilities.generation_loss {
            LossTarget::Sequences(session.generate_labels(&batch)?)
        } else {
            match session.forward(&batch)? {
                ModelOutput::Scores(rows) => LossTarget::Classes(backend::argmax_rows(&rows)),
                ModelOutput::Text(_) => {
                    return Err(AdapterError::IncompatibleModel {
                        model: session.name().to_string(),
                    }
                    .into());
                }
            }
        };
        trace!(?target, "loss target selected");

        let gradient = session
            .embedding_gradient(&batch, &target)?
            .into_iter()
            .next()
            .ok_or_else(|| eyre::eyre!("no gradient captured for the input"))?;
        drop(session);

        debug!(tokens = ids.len(), "gradient computed");
        Ok(GradientResult { ids, gradient })
    }

    /// Token strings for each input, obtained by mapping the ids the model
    /// would consume back to tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer rejects an input.
    pub fn tokenize_to_strings(
        &self,
        inputs: &[&str],
        options: TokenizeOptions,
    ) -> Result<Vec<Vec<String>>> {
        let tokens = inputs
            .iter()
            .map(|text| -> Result<Vec<String>> {
                let encoding = self.tokenizer.encode(text)?;
                Ok(self.tokenizer.convert_ids_to_tokens(encoding.input_ids()?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(tokens::postprocess(tokens, options))
    }
}

/// Resolves a repository-relative file name to a local path.
type Fetch<'a> = &'a dyn Fn(&str) -> Result<PathBuf>;

#[allow(clippy::needless_return, unused_variables)]
fn load_auto_backend(name: &str, fetch: Fetch) -> Result<Box<dyn QueryModel>> {
    #[cfg(feature = "candle")]
    return load_candle_backend(name, fetch);

    #[cfg(all(feature = "onnx", not(feature = "candle")))]
    return load_onnx_backend(name, fetch);

    #[cfg(not(any(feature = "onnx", feature = "candle")))]
    return Err(eyre::eyre!("no model backend compiled in"));
}

#[cfg(feature = "candle")]
fn load_candle_backend(name: &str, fetch: Fetch) -> Result<Box<dyn QueryModel>> {
    let safetensors_path = fetch("model.safetensors")?;
    let config_path = fetch("config.json")?;
    match model_type(&config_path)?.as_str() {
        "bert" => Ok(Box::new(bert::BertClassifier::load(
            name,
            &safetensors_path,
            &config_path,
        )?)),
        "embedding-bag" => {
            let model = candle::EmbeddingBagClassifier::load(&safetensors_path, &config_path)?;
            Ok(Box::new(model))
        }
        "deberta-v2" => Ok(Box::new(candle::DebertaClassifier::load(
            name,
            &safetensors_path,
            &config_path,
        )?)),
        other => Err(AdapterError::Configuration(format!(
            "candle backend cannot load model_type `{other}` ({name})"
        ))
        .into()),
    }
}

#[cfg(not(feature = "candle"))]
fn load_candle_backend(_name: &str, _fetch: Fetch) -> Result<Box<dyn QueryModel>> {
    Err(eyre::eyre!(
        "candle backend not compiled in (enable 'candle' feature)"
    ))
}

#[cfg(feature = "onnx")]
fn load_onnx_backend(name: &str, fetch: Fetch) -> Result<Box<dyn QueryModel>> {
    let model_path = fetch("onnx/model.onnx")?;
    Ok(Box::new(onnx::OnnxClassifier::load(name, &model_path)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx_backend(_name: &str, _fetch: Fetch) -> Result<Box<dyn QueryModel>> {
    Err(eyre::eyre!("onnx backend not compiled in (enable 'onnx' feature)"))
}

/// `model_type` from a `config.json`.
#[cfg_attr(not(feature = "candle"), allow(dead_code))]
fn model_type(config_path: &Path) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct ModelType {
        #[serde(default)]
        model_type: Option<String>,
    }

    let content = std::fs::read_to_string(config_path)?;
    let parsed: ModelType = serde_json::from_str(&content)?;
    parsed.model_type.ok_or_else(|| {
        AdapterError::Configuration(format!("{} has no model_type", config_path.display())).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_read_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"model_type": "deberta-v2", "hidden_size": 768}"#).unwrap();
        assert_eq!(model_type(&path).unwrap(), "deberta-v2");

        std::fs::write(&path, r#"{"hidden_size": 768}"#).unwrap();
        let err = model_type(&path).unwrap_err();
        assert!(matches!(
            AdapterError::kind_of(&err),
            Some(AdapterError::Configuration(_))
        ));
    }

    #[cfg(feature = "candle")]
    mod bert_backend {
        use candle_core::{DType, Device};
        use candle_nn::VarBuilder;

        use perturb_core::Config;
        use perturb_core::config::BackendKind;

        use crate::bert::BertClassifier;
        use crate::fixtures::{BERT_CONFIG, WORD_LEVEL, bert_config, bert_tensors};
        use crate::{ModelMode, ModelOutput, ModelQueryAdapter};

        const INPUTS: [&str; 3] = ["the cat sat", "cat", "the sat"];

        fn adapter(batch_size: usize) -> ModelQueryAdapter {
            let vb = VarBuilder::from_tensors(bert_tensors(), DType::F32, &Device::Cpu);
            let model = BertClassifier::from_var_builder("tiny-bert", &bert_config(), &vb).unwrap();
            let config = Config {
                batch_size,
                ..Config::default()
            };
            ModelQueryAdapter::with_tokenizer(Box::new(model), WORD_LEVEL.parse().unwrap(), &config)
                .unwrap()
        }

        fn model_dir() -> tempfile::TempDir {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL).unwrap();
            std::fs::write(dir.path().join("config.json"), BERT_CONFIG).unwrap();
            candle_core::safetensors::save(&bert_tensors(), dir.path().join("model.safetensors"))
                .unwrap();
            dir
        }

        fn assert_rows_close(a: &ModelOutput, b: &ModelOutput) {
            let (a, b) = (a.as_scores().unwrap(), b.as_scores().unwrap());
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().flatten().zip(b.iter().flatten()) {
                assert!((x - y).abs() < 1e-4, "{a:?} != {b:?}");
            }
        }

        #[test]
        fn raw_tokenizer_collates_ragged_inputs() {
            let single = adapter(1).predict(&INPUTS, false).unwrap();
            let whole = adapter(INPUTS.len()).predict(&INPUTS, false).unwrap();
            assert_eq!(single.len(), 3);
            assert_rows_close(&single, &whole);
        }

        #[test]
        fn local_bert_directory_computes_gradients() {
            let dir = model_dir();
            let config = Config {
                backend: BackendKind::Candle,
                ..Config::default()
            };
            let mut adapter = ModelQueryAdapter::from_dir(dir.path(), &config).unwrap();

            let result = adapter.get_gradient("the cat sat").unwrap();
            assert_eq!(result.ids, [2, 3, 4]);
            assert_eq!(result.gradient.len(), 3);
            assert!(result.gradient.iter().all(|row| row.len() == 4));
            assert!(result.gradient.iter().flatten().any(|g| g.abs() > 0.0));

            assert_eq!(adapter.model().mode(), ModelMode::Eval);
            assert!(!adapter.model().embedding_trainable());
        }

        #[test]
        fn local_directory_matches_in_memory_model() {
            let dir = model_dir();
            let mut loaded = ModelQueryAdapter::from_dir(dir.path(), &Config::default()).unwrap();
            let expected = adapter(32).predict(&INPUTS, false).unwrap();
            assert_rows_close(&loaded.predict(&INPUTS, false).unwrap(), &expected);
        }

        #[test]
        fn missing_local_file_is_error() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL).unwrap();
            let err = ModelQueryAdapter::from_dir(dir.path(), &Config::default()).err().unwrap();
            assert!(err.to_string().contains("not found"));
        }
    }
}
