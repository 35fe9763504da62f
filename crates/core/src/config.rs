//! Runtime configuration for model queries and word substitution.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::AdapterError;

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_ARTIFACT_REPO: &str = "perturb-rs/word-embeddings";
const ARTIFACT_DIR_ENV: &str = "PERTURB_ARTIFACT_DIR";

/// Inference backend used by `from_pretrained`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Candle when compiled in, otherwise ONNX.
    #[default]
    Auto,
    Candle,
    Onnx,
}

/// Runtime configuration, usually read from `~/.config/perturb/config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `HuggingFace` token for gated model and artifact downloads.
    pub hf_token: Option<String>,
    /// Sub-batch size for `predict`.
    pub batch_size: usize,
    /// Truncate encodings to this many tokens.
    pub max_length: Option<usize>,
    /// Local root of `{artifact_dir}/{embedding_source}/{artifact}`.
    pub artifact_dir: PathBuf,
    /// Hub dataset repo that missing embedding artifacts are fetched from.
    pub artifact_repo: String,
    /// Upper bound on neighbour candidates per word, applied on top of
    /// whatever a caller requests.
    pub max_candidates: Option<usize>,
    pub replace_stopwords: bool,
    pub backend: BackendKind,
}

impl Config {
    /// Load `~/.config/perturb/config.toml`, falling back to defaults when the
    /// file does not exist. `PERTURB_ARTIFACT_DIR` overrides `artifact_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> crate::Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => {
                debug!("no config file, using defaults");
                Self::default()
            }
        };

        if let Ok(dir) = std::env::var(ARTIFACT_DIR_ENV) {
            debug!(dir, "artifact dir overridden from env");
            config.artifact_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] for a zero batch size.
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(AdapterError::Configuration("batch_size must be at least 1".into()).into());
        }
        Ok(())
    }

    /// Token with surrounding whitespace removed; blank tokens count as absent.
    #[must_use]
    pub fn hf_token(&self) -> Option<String> {
        self.hf_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".config").join("perturb").join("config.toml"))
}

fn default_artifact_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("perturb")
        .join("word_embeddings")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hf_token: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_length: None,
            artifact_dir: default_artifact_dir(),
            artifact_repo: DEFAULT_ARTIFACT_REPO.to_string(),
            max_candidates: None,
            replace_stopwords: false,
            backend: BackendKind::default(),
        }
    }
}
