use std::cell::RefCell;
use std::rc::Rc;

use perturb_core::{AdapterError, Result};
use perturb_model::encoding::{ATTENTION_MASK, INPUT_IDS};
use perturb_model::{
    Capabilities, EncodedBatch, Encoding, LossTarget, ModelMode, ModelOutput, ModelQueryAdapter,
    QueryModel, TextTokenizer, TokenizeOptions,
};

const VOCAB: &[&str] = &[
    "[UNK]", "text", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "22,", "▁paris", "##ian",
    "good", "bad", "movie",
];

/// Whitespace tokenizer over a fixed vocabulary, no padding and no native
/// batch encoding.
struct WordTokenizer;

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Encoding> {
        let ids: Vec<u32> = text
            .split_whitespace()
            .map(|w| {
                VOCAB
                    .iter()
                    .position(|v| *v == w)
                    .map_or(0, |i| u32::try_from(i).unwrap())
            })
            .collect();
        let mask = vec![1; ids.len()];
        Ok(Encoding::new()
            .with_field(INPUT_IDS, ids)
            .with_field(ATTENTION_MASK, mask))
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| VOCAB.get(id as usize).copied().unwrap_or_default().to_string())
            .collect()
    }
}

#[derive(Default)]
struct Calls {
    forward_sizes: Vec<usize>,
    logits_calls: usize,
    targets: Vec<LossTarget>,
    generated: usize,
}

/// Scores each row as `[sum(ids), len(ids)]`.
struct MockModel {
    capabilities: Capabilities,
    text_output: bool,
    fail_backward: bool,
    mode: ModelMode,
    trainable: bool,
    calls: Rc<RefCell<Calls>>,
}

impl MockModel {
    fn new(capabilities: Capabilities) -> (Self, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let model = Self {
            capabilities,
            text_output: false,
            fail_backward: false,
            mode: ModelMode::Eval,
            trainable: false,
            calls: Rc::clone(&calls),
        };
        (model, calls)
    }

    fn rows(batch: &EncodedBatch) -> Vec<Vec<u32>> {
        batch.get(INPUT_IDS).unwrap().to_vec()
    }
}

impl QueryModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn forward(&mut self, batch: &EncodedBatch) -> Result<ModelOutput> {
        self.calls.borrow_mut().forward_sizes.push(batch.len());
        let rows = Self::rows(batch);
        if self.text_output {
            return Ok(ModelOutput::Text(
                rows.iter()
                    .map(|ids| format!("out-{}", ids.iter().sum::<u32>()))
                    .collect(),
            ));
        }
        Ok(ModelOutput::Scores(
            rows.iter()
                .map(|ids| vec![ids.iter().sum::<u32>() as f32, ids.len() as f32])
                .collect(),
        ))
    }

    fn logits(&mut self, batch: &EncodedBatch) -> Result<Vec<Vec<f32>>> {
        self.calls.borrow_mut().logits_calls += 1;
        assert_eq!(batch.keys().collect::<Vec<_>>(), [INPUT_IDS]);
        Ok(Self::rows(batch)
            .iter()
            .map(|ids| vec![ids.iter().sum::<u32>() as f32])
            .collect())
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn embedding_trainable(&self) -> bool {
        self.trainable
    }

    fn set_embedding_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    fn generate_labels(&mut self, batch: &EncodedBatch) -> Result<Vec<Vec<u32>>> {
        self.calls.borrow_mut().generated += 1;
        Ok(Self::rows(batch))
    }

    fn embedding_gradient(
        &mut self,
        batch: &EncodedBatch,
        target: &LossTarget,
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        assert_eq!(self.mode, ModelMode::Train);
        assert!(self.trainable);
        self.calls.borrow_mut().targets.push(target.clone());
        if self.fail_backward {
            return Err(eyre::eyre!("backward failed"));
        }
        Ok(Self::rows(batch)
            .iter()
            .map(|ids| ids.iter().map(|&id| vec![id as f32, -(id as f32)]).collect())
            .collect())
    }
}

fn adapter(model: MockModel, batch_size: usize) -> ModelQueryAdapter {
    ModelQueryAdapter::new(Box::new(model), Box::new(WordTokenizer), batch_size).unwrap()
}

fn ten_inputs() -> Vec<String> {
    (0..10).map(|i| format!("text {i}")).collect()
}

#[test]
fn predict_length_matches_input() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let mut adapter = adapter(model, 4);
    let inputs = ten_inputs();
    let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();

    let out = adapter.predict(&inputs, false).unwrap();
    assert_eq!(out.len(), 10);
    // "text i" encodes to ids [1, 2 + i].
    for (i, row) in out.as_scores().unwrap().iter().enumerate() {
        assert_eq!(row[0], (3 + i) as f32);
    }
}

#[test]
fn sub_batching_matches_single_pass() {
    let inputs = ten_inputs();
    let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();

    let (small, small_calls) = MockModel::new(Capabilities::CLASSIFIER);
    let (whole, whole_calls) = MockModel::new(Capabilities::CLASSIFIER);
    let batched = adapter(small, 3).predict(&inputs, false).unwrap();
    let single = adapter(whole, 10).predict(&inputs, false).unwrap();

    assert_eq!(batched, single);
    assert_eq!(small_calls.borrow().forward_sizes, vec![3, 3, 3, 1]);
    assert_eq!(whole_calls.borrow().forward_sizes, vec![10]);
}

#[test]
fn return_logits_skips_batching() {
    let (model, calls) = MockModel::new(Capabilities::CLASSIFIER);
    let mut adapter = adapter(model, 3);
    let inputs = ten_inputs();
    let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();

    let out = adapter.predict(&inputs, true).unwrap();
    assert_eq!(out.len(), 10);
    assert_eq!(calls.borrow().logits_calls, 1);
    assert!(calls.borrow().forward_sizes.is_empty());
}

#[test]
fn empty_input_never_reaches_model() {
    let (model, calls) = MockModel::new(Capabilities::CLASSIFIER);
    let out = adapter(model, 3).predict(&[], false).unwrap();
    assert!(out.is_empty());
    assert!(calls.borrow().forward_sizes.is_empty());
}

#[test]
fn ragged_batch_is_encoding_mismatch() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let err = adapter(model, 8)
        .predict(&["good movie", "bad"], false)
        .unwrap_err();
    assert!(matches!(
        AdapterError::kind_of(&err),
        Some(AdapterError::EncodingMismatch(_))
    ));
}

#[test]
fn text_to_text_output_returned_unmodified() {
    let (mut model, _) = MockModel::new(Capabilities::TEXT_TO_TEXT);
    model.text_output = true;
    let out = adapter(model, 2).predict(&["text 1", "text 2", "text 3"], false).unwrap();
    assert_eq!(out.as_text().unwrap(), ["out-4", "out-5", "out-6"]);
}

#[test]
fn gradient_uses_argmax_pseudo_label() {
    let (model, calls) = MockModel::new(Capabilities::CLASSIFIER);
    let mut adapter = adapter(model, 32);

    let result = adapter.get_gradient("good movie").unwrap();
    assert_eq!(result.ids, vec![15, 17]);
    assert_eq!(result.gradient, vec![vec![15.0, -15.0], vec![17.0, -17.0]]);
    // scores are [32, 2]; class 0 wins.
    assert_eq!(calls.borrow().targets, vec![LossTarget::Classes(vec![0])]);
}

#[test]
fn gradient_restores_state_between_calls() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let mut adapter = adapter(model, 32);

    let first = adapter.get_gradient("good movie").unwrap();
    assert_eq!(adapter.model().mode(), ModelMode::Eval);
    assert!(!adapter.model().embedding_trainable());

    let second = adapter.get_gradient("good movie").unwrap();
    assert_eq!(adapter.model().mode(), ModelMode::Eval);
    assert!(!adapter.model().embedding_trainable());
    assert_eq!(first, second);
}

#[test]
fn gradient_restores_state_after_failure() {
    let (mut model, _) = MockModel::new(Capabilities::CLASSIFIER);
    model.fail_backward = true;
    model.trainable = true;
    let mut adapter = adapter(model, 32);

    for _ in 0..2 {
        let err = adapter.get_gradient("bad movie").unwrap_err();
        assert_eq!(err.to_string(), "backward failed");
        assert_eq!(adapter.model().mode(), ModelMode::Eval);
        assert!(adapter.model().embedding_trainable());
    }
}

#[test]
fn generation_models_use_self_generated_labels() {
    let (model, calls) = MockModel::new(Capabilities::SEQ2SEQ);
    let mut adapter = adapter(model, 32);

    adapter.get_gradient("text 5").unwrap();
    let calls = calls.borrow();
    assert_eq!(calls.generated, 1);
    assert_eq!(calls.targets, vec![LossTarget::Sequences(vec![vec![1, 7]])]);
    assert!(calls.forward_sizes.is_empty());
}

#[test]
fn text_to_text_gradient_unsupported() {
    let (model, calls) = MockModel::new(Capabilities::TEXT_TO_TEXT);
    let mut adapter = adapter(model, 32);

    let err = adapter.get_gradient("text 1").unwrap_err();
    assert!(matches!(
        AdapterError::kind_of(&err),
        Some(AdapterError::UnsupportedOperation { .. })
    ));
    assert!(calls.borrow().targets.is_empty());
    assert_eq!(adapter.model().mode(), ModelMode::Eval);
}

#[test]
fn base_model_is_incompatible() {
    let base = Capabilities {
        classification_loss: false,
        generation_loss: false,
        gradient: true,
    };
    let (model, _) = MockModel::new(base);
    let err = adapter(model, 32).get_gradient("text 1").unwrap_err();
    assert!(matches!(
        AdapterError::kind_of(&err),
        Some(AdapterError::IncompatibleModel { .. })
    ));
}

#[test]
fn tokenize_splits_glued_number_comma() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let adapter = adapter(model, 32);

    let tokens = adapter
        .tokenize_to_strings(&["22,"], TokenizeOptions::default())
        .unwrap();
    assert_eq!(tokens, vec![vec!["22".to_string(), ",".to_string()]]);
}

#[test]
fn tokenize_strips_prefixes_on_request() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let adapter = adapter(model, 32);
    let options = TokenizeOptions {
        strip_prefixes: true,
        split_numeric_punctuation: false,
    };

    let tokens = adapter
        .tokenize_to_strings(&["▁paris ##ian", "good"], options)
        .unwrap();
    assert_eq!(
        tokens,
        vec![
            vec!["paris".to_string(), "ian".to_string()],
            vec!["good".to_string()]
        ]
    );
}

#[test]
fn zero_batch_size_rejected() {
    let (model, _) = MockModel::new(Capabilities::CLASSIFIER);
    let result = ModelQueryAdapter::new(Box::new(model), Box::new(WordTokenizer), 0);
    assert!(result.is_err());
}
