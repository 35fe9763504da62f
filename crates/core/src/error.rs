pub type Result<T> = eyre::Result<T>;

/// Failures the adapter layer reports with a distinct meaning.
///
/// Everything else (inference errors, I/O while loading artifacts) travels
/// as a plain `eyre::Report`. Callers recover these with
/// `report.downcast_ref::<AdapterError>()`.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("cannot collate batch: {0}")]
    EncodingMismatch(String),
    #[error(
        "{model} does not take `labels` to compute a loss; this usually means a base model \
         was loaded where a sequence-classification model was expected"
    )]
    IncompatibleModel { model: String },
    #[error("{operation} is not supported for {model}")]
    UnsupportedOperation { operation: &'static str, model: String },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AdapterError {
    /// Check whether a report carries this error variant's kind.
    #[must_use]
    pub fn kind_of(report: &eyre::Report) -> Option<&Self> {
        report.downcast_ref::<Self>()
    }
}
