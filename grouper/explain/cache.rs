//! On-disk cache of built explainers.
//!
//! Entries are TOML files named by model kind and cache key. A key covers the
//! model fingerprint and every byte of the background sample, so an entry is
//! only ever reused for the exact model and background it was built from.

use super::{ExplainError, Explainer};
use crate::model::{ModelKind, TrainedModel, hex_digest};
use log::{info, warn};
use ndarray::{Array2, ArrayView2};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// SHA-256 over the model fingerprint, the background shape, and the
/// little-endian bytes of every background value in row-major order.
pub fn cache_key(model: &TrainedModel, background: ArrayView2<f64>) -> Result<String, ExplainError> {
    let mut hasher = Sha256::new();
    hasher.update(model.fingerprint()?.as_bytes());
    hasher.update((background.nrows() as u64).to_le_bytes());
    hasher.update((background.ncols() as u64).to_le_bytes());
    for value in background.iter() {
        hasher.update(value.to_bits().to_le_bytes());
    }
    Ok(hex_digest(&hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct ExplainerCache {
    dir: PathBuf,
}

impl ExplainerCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ExplainError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, kind: ModelKind, key: &str) -> PathBuf {
        self.dir.join(format!("explainer_{kind}_{key}.toml"))
    }

    /// The cached explainer for `key`, if a readable entry with a matching key
    /// exists. Unreadable entries are reported and treated as misses.
    pub fn load(&self, kind: ModelKind, key: &str) -> Result<Option<Explainer>, ExplainError> {
        let path = self.entry_path(kind, key);
        if !path.exists() {
            return Ok(None);
        }
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Ignoring unreadable explainer cache entry {}: {e}", path.display());
                return Ok(None);
            }
        };
        let explainer: Explainer = match toml::from_str(&text) {
            Ok(explainer) => explainer,
            Err(e) => {
                warn!("Ignoring unreadable explainer cache entry {}: {e}", path.display());
                return Ok(None);
            }
        };
        if explainer.cache_key != key || explainer.model_kind != kind {
            warn!(
                "Explainer cache entry {} holds key {}; rebuilding.",
                path.display(),
                explainer.cache_key
            );
            return Ok(None);
        }
        Ok(Some(explainer))
    }

    /// Writes `explainer` to a temporary file and renames it into place.
    pub fn store(&self, explainer: &Explainer) -> Result<PathBuf, ExplainError> {
        let path = self.entry_path(explainer.model_kind, &explainer.cache_key);
        let tmp = path.with_extension("toml.tmp");
        let text = toml::to_string_pretty(explainer)?;
        {
            let file = fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(text.as_bytes())?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Returns the cached explainer for this model and background, building
    /// and storing one on a miss. A failed store is reported and the built
    /// explainer is still returned.
    pub fn get_or_build(
        &self,
        model: &TrainedModel,
        background: Array2<f64>,
    ) -> Result<Explainer, ExplainError> {
        let key = cache_key(model, background.view())?;
        if let Some(explainer) = self.load(model.kind(), &key)? {
            info!("Reusing cached {} explainer {}.", model.kind(), &key[..12]);
            return Ok(explainer);
        }
        let explainer = Explainer::build(model, background)?;
        match self.store(&explainer) {
            Ok(path) => info!("Cached {} explainer at {}.", model.kind(), path.display()),
            Err(e) => warn!("Could not cache the {} explainer: {e}", model.kind()),
        }
        Ok(explainer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explain::sample_background;
    use crate::linear::{LogisticConfig, LogisticModel};
    use crate::model::Classifier;
    use crate::test_fixtures::{feature_names, labelled_matrix};
    use tempfile::tempdir;

    fn logistic(seed: u64) -> (TrainedModel, Array2<f64>) {
        let (x, y) = labelled_matrix(200, seed);
        let model =
            LogisticModel::fit(x.view(), y.view(), &feature_names(4), &LogisticConfig::default())
                .unwrap();
        (model.into(), x)
    }

    #[test]
    fn key_depends_on_model_and_background() {
        let (a, x) = logistic(1);
        let (b, _) = logistic(2);
        let bg = sample_background(x.view(), 20, 1);
        let other_bg = sample_background(x.view(), 20, 2);
        let key = cache_key(&a, bg.view()).unwrap();
        assert_eq!(key, cache_key(&a, bg.view()).unwrap());
        assert_ne!(key, cache_key(&b, bg.view()).unwrap());
        assert_ne!(key, cache_key(&a, other_bg.view()).unwrap());
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn stored_explainer_is_reused() {
        let dir = tempdir().unwrap();
        let cache = ExplainerCache::open(dir.path().join("explainers")).unwrap();
        let (model, x) = logistic(3);
        let bg = sample_background(x.view(), 15, 1);

        let built = cache.get_or_build(&model, bg.clone()).unwrap();
        let path = cache.entry_path(model.kind(), &built.cache_key);
        assert!(path.exists());
        assert!(!path.with_extension("toml.tmp").exists());

        let loaded = cache.load(model.kind(), &built.cache_key).unwrap().unwrap();
        assert_eq!(loaded.cache_key, built.cache_key);
        assert_eq!(loaded.background(), built.background());
        assert_eq!(loaded.base_value(), built.base_value());
    }

    #[test]
    fn entry_under_a_different_key_is_never_reused() {
        let dir = tempdir().unwrap();
        let cache = ExplainerCache::open(dir.path()).unwrap();
        let (model, x) = logistic(4);
        let built = Explainer::build(&model, sample_background(x.view(), 10, 1)).unwrap();
        let stored = cache.store(&built).unwrap();
        let forged = cache.entry_path(model.kind(), "deadbeef");
        fs::copy(&stored, &forged).unwrap();
        assert!(cache.load(model.kind(), "deadbeef").unwrap().is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = ExplainerCache::open(dir.path()).unwrap();
        fs::write(cache.entry_path(ModelKind::Logistic, "abc"), "not = [valid").unwrap();
        assert!(cache.load(ModelKind::Logistic, "abc").unwrap().is_none());
    }

    #[test]
    fn unreadable_entry_is_rebuilt() {
        let dir = tempdir().unwrap();
        let cache = ExplainerCache::open(dir.path()).unwrap();
        let (model, x) = logistic(5);
        let bg = sample_background(x.view(), 10, 1);
        let key = cache_key(&model, bg.view()).unwrap();
        // A directory squatting on the entry path cannot be read as a file.
        fs::create_dir(cache.entry_path(model.kind(), &key)).unwrap();

        assert!(cache.load(model.kind(), &key).unwrap().is_none());
        let rebuilt = cache.get_or_build(&model, bg).unwrap();
        assert_eq!(rebuilt.cache_key, key);
    }
}
