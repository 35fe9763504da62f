//! Named embedding sources and their on-disk artifacts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use eyre::WrapErr;
use perturb_core::{AdapterError, Config, Result, hub};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// A precomputed embedding space with its word table and neighbour ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingSource {
    /// Counter-fitted paragram-SL999 vectors, 300 dimensions.
    Paragram300Sl999,
}

/// File names of the three artifacts a source ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artifacts {
    /// `[vocab, dim]` float matrix.
    pub embeddings: &'static str,
    /// JSON object of word to row index.
    pub word_list: &'static str,
    /// `[vocab, k]` integer matrix, row `i` holds ids nearest to word `i`.
    pub neighbors: &'static str,
}

impl Artifacts {
    #[must_use]
    pub const fn all(&self) -> [&'static str; 3] {
        [self.embeddings, self.word_list, self.neighbors]
    }
}

impl EmbeddingSource {
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] for an unrecognized name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "paragram_300_sl999" | "paragramcf" => Ok(Self::Paragram300Sl999),
            other => Err(AdapterError::Configuration(format!(
                "could not find word embedding `{other}`"
            ))
            .into()),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Paragram300Sl999 => "paragram_300_sl999",
        }
    }

    #[must_use]
    pub const fn artifacts(self) -> Artifacts {
        match self {
            Self::Paragram300Sl999 => Artifacts {
                embeddings: "paragram_300_sl999.npy",
                word_list: "wordlist.json",
                neighbors: "nn.npy",
            },
        }
    }

    /// `{base}/{source}`
    #[must_use]
    pub fn dir(self, base: &Path) -> PathBuf {
        base.join(self.name())
    }
}

impl FromStr for EmbeddingSource {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// Make sure every artifact of `source` exists under
/// `{config.artifact_dir}/{source}`, fetching missing ones from the configured
/// hub dataset. Returns the source directory.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or a download fails.
#[instrument(skip(config), fields(base = %config.artifact_dir.display()))]
pub fn download_if_needed(config: &Config, source: EmbeddingSource) -> Result<PathBuf> {
    let dir = source.dir(&config.artifact_dir);
    let missing: Vec<&str> = source
        .artifacts()
        .all()
        .into_iter()
        .filter(|artifact| !dir.join(artifact).exists())
        .collect();

    if missing.is_empty() {
        debug!(dir = %dir.display(), "artifacts present");
        return Ok(dir);
    }

    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    let repo = hub::api(config)?.dataset(config.artifact_repo.clone());

    for artifact in missing {
        let cached = hub::fetch(&repo, &format!("{}/{artifact}", source.name()))?;
        install(&cached, &dir.join(artifact))?;
        info!(artifact, repo = %config.artifact_repo, "artifact downloaded");
    }

    Ok(dir)
}

/// Copy `cached` to `target` through a temp file in the same directory, so an
/// interrupted copy never leaves a partial artifact under the final name.
fn install(cached: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| eyre::eyre!("{} has no parent directory", target.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .wrap_err_with(|| format!("failed to create temp file in {}", parent.display()))?;
    let mut source =
        File::open(cached).wrap_err_with(|| format!("failed to open {}", cached.display()))?;
    std::io::copy(&mut source, tmp.as_file_mut())
        .wrap_err_with(|| format!("failed to copy {} to {}", cached.display(), target.display()))?;
    tmp.persist(target)
        .map_err(|e| e.error)
        .wrap_err_with(|| format!("failed to move artifact into {}", target.display()))?;
    Ok(())
}
