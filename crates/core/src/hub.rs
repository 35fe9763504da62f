//! `HuggingFace` hub access for model weights and embedding artifacts.

use std::path::PathBuf;

use eyre::WrapErr;
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use tracing::debug;

use crate::Config;

/// Build a hub client, authenticated when a token is configured.
///
/// # Errors
///
/// Returns an error if the `HuggingFace` API client cannot be built.
pub fn api(config: &Config) -> crate::Result<Api> {
    let mut builder = ApiBuilder::new();
    if let Some(token) = config.hf_token() {
        debug!("using HuggingFace token from config");
        builder = builder.with_token(Some(token));
    } else {
        debug!("no HuggingFace token configured");
    }
    builder
        .build()
        .wrap_err("failed to build HuggingFace API client")
}

/// Download `file` from `repo` into the hub cache and return its local path.
///
/// # Errors
///
/// Returns an error if the download fails.
pub fn fetch(repo: &ApiRepo, file: &str) -> crate::Result<PathBuf> {
    let path = repo
        .get(file)
        .map_err(|e| eyre::eyre!("{file} download failed: {e}"))?;
    debug!(file, path = %path.display(), "hub file ready");
    Ok(path)
}
