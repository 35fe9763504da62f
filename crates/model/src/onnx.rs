use std::path::Path;

use ort::session::Session;
use ort::value::Tensor;
use perturb_core::{AdapterError, Result};
use tracing::debug;

use crate::backend::{Capabilities, ModelMode, ModelOutput, QueryModel};
use crate::encoding::{ATTENTION_MASK, EncodedBatch, INPUT_IDS};

/// ONNX Runtime sequence classifier. Inference only.
pub struct OnnxClassifier {
    name: String,
    session: Session,
    mode: ModelMode,
    embedding_trainable: bool,
}

impl OnnxClassifier {
    /// # Errors
    ///
    /// Returns an error if the ONNX session cannot be loaded.
    pub fn load(name: impl Into<String>, model_path: &Path) -> Result<Self> {
        let session = Session::builder()?.commit_from_file(model_path)?;
        let name = name.into();
        debug!(name, path = %model_path.display(), "ONNX session loaded");
        Ok(Self {
            name,
            session,
            mode: ModelMode::Eval,
            embedding_trainable: false,
        })
    }
}

fn i64_tensor(batch: &EncodedBatch, name: &str) -> Result<Option<Tensor<i64>>> {
    let Some((flat, (rows, cols))) = batch.flat(name) else {
        return Ok(None);
    };
    let values: Vec<i64> = flat.into_iter().map(i64::from).collect();
    let shape = vec![i64::try_from(rows)?, i64::try_from(cols)?];
    Ok(Some(Tensor::from_array((shape, values))?))
}

impl QueryModel for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INFERENCE_ONLY
    }

    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput> {
        let input_ids = i64_tensor(batch, INPUT_IDS)?.ok_or_else(|| {
            eyre::Report::from(AdapterError::EncodingMismatch(
                "batch has no `input_ids` field".into(),
            ))
        })?;
        let attention_mask = match i64_tensor(batch, ATTENTION_MASK)? {
            Some(mask) => mask,
            None => {
                let (flat, (rows, cols)) = batch.flat(INPUT_IDS).unwrap_or_default();
                let shape = vec![i64::try_from(rows)?, i64::try_from(cols)?];
                Tensor::from_array((shape, vec![1i64; flat.len()]))?
            }
        };

        let outputs = self
            .session
            .run(ort::inputs![input_ids, attention_mask])?;

        let logits = outputs[0].try_extract_array::<f32>()?;
        let rows = logits
            .outer_iter()
            .map(|row| row.iter().copied().collect())
            .collect();
        Ok(ModelOutput::Scores(rows))
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
