use perturb_core::{AdapterError, Result};
use tracing::trace;

use crate::backend::ModelOutput;
use crate::encoding::{EncodedBatch, Encoding, collate};

/// Run `predict` over consecutive sub-batches of at most `batch_size`
/// encodings and concatenate the results in input order.
///
/// # Errors
///
/// Returns an error for a zero `batch_size`, if a sub-batch fails to
/// collate, if `predict` fails, or if it returns a different number of rows
/// than it was given.
pub fn batch_model_predict<F>(
    encodings: &[Encoding],
    batch_size: usize,
    mut predict: F,
) -> Result<ModelOutput>
where
    F: FnMut(&EncodedBatch) -> Result<ModelOutput>,
{
    if batch_size == 0 {
        return Err(AdapterError::Configuration("batch_size must be at least 1".into()).into());
    }

    let mut output: Option<ModelOutput> = None;
    for (i, chunk) in encodings.chunks(batch_size).enumerate() {
        let batch = collate(chunk)?;
        let rows = predict(&batch)?;
        if rows.len() != chunk.len() {
            return Err(eyre::eyre!(
                "model returned {} rows for a sub-batch of {} inputs",
                rows.len(),
                chunk.len()
            ));
        }
        trace!(sub_batch = i, rows = rows.len(), "sub-batch predicted");
        match output.as_mut() {
            Some(acc) => acc.append(rows)?,
            None => output = Some(rows),
        }
    }

    Ok(output.unwrap_or_default())
}
