//! # Trained Model Artifacts
//!
//! Both model families implement [`Classifier`], and a trained model of either
//! family travels through the pipeline as a [`TrainedModel`]. Artifacts are
//! persisted as human-readable TOML, and the SHA-256 of that serialization is
//! the model's fingerprint.

use crate::boost::BoostedEnsemble;
use crate::resample::ResampleError;
use crate::linear::LogisticModel;
use crate::sigmoid;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as FmtWrite};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Failures while fitting either model family.
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(
        "The training labels contain {classes} distinct class(es); at least two are required."
    )]
    SingleClass { classes: usize },
    #[error("The training partition is empty.")]
    EmptyTrainingSet,
    #[error("The design matrix has {rows} rows, but {labels} labels were provided.")]
    DimensionMismatch { rows: usize, labels: usize },
    #[error("The design matrix has {expected} columns, but {found} feature names were provided.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Training label {0} is not 0 or 1.")]
    NonBinaryLabel(f64),
    #[error("The penalized weighted least-squares system could not be solved: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
    #[error("Oversampling the training partition failed: {0}")]
    Resampling(#[from] ResampleError),
}

/// Failures while persisting or applying a trained model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
}

/// The capability set shared by both model families.
pub trait Classifier: Sized + Sync {
    type Config;

    /// Fits the model to a design matrix whose columns follow `feature_names`.
    fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        feature_names: &[String],
        config: &Self::Config,
    ) -> Result<Self, TrainingError>;

    fn feature_names(&self) -> &[String];

    /// The log-odds score of a single row.
    fn margin(&self, row: ArrayView1<f64>) -> f64;

    fn predict_margin(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let margins: Vec<f64> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.margin(row))
            .collect();
        Array1::from_vec(margins)
    }

    fn predict_probability(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.predict_margin(x).mapv(sigmoid)
    }
}

/// Which family a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Logistic,
    Boosted,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Boosted => "boosted",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fitted model of either family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainedModel {
    Logistic(LogisticModel),
    Boosted(BoostedEnsemble),
}

impl From<LogisticModel> for TrainedModel {
    fn from(model: LogisticModel) -> Self {
        TrainedModel::Logistic(model)
    }
}

impl From<BoostedEnsemble> for TrainedModel {
    fn from(model: BoostedEnsemble) -> Self {
        TrainedModel::Boosted(model)
    }
}

impl TrainedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            TrainedModel::Logistic(_) => ModelKind::Logistic,
            TrainedModel::Boosted(_) => ModelKind::Boosted,
        }
    }

    pub fn feature_names(&self) -> &[String] {
        match self {
            TrainedModel::Logistic(m) => m.feature_names(),
            TrainedModel::Boosted(m) => m.feature_names(),
        }
    }

    pub fn margin(&self, row: ArrayView1<f64>) -> f64 {
        match self {
            TrainedModel::Logistic(m) => m.margin(row),
            TrainedModel::Boosted(m) => m.margin(row),
        }
    }

    pub fn predict_margin(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        self.check_width(x.ncols())?;
        Ok(match self {
            TrainedModel::Logistic(m) => m.predict_margin(x),
            TrainedModel::Boosted(m) => m.predict_margin(x),
        })
    }

    /// Probabilities of the positive class for every row of `x`.
    pub fn predict_probability(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(self.predict_margin(x)?.mapv(sigmoid))
    }

    fn check_width(&self, found: usize) -> Result<(), ModelError> {
        let expected = self.feature_names().len();
        if found != expected {
            return Err(ModelError::FeatureCountMismatch { expected, found });
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ModelError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Hex SHA-256 of the TOML serialization.
    pub fn fingerprint(&self) -> Result<String, ModelError> {
        let digest = Sha256::digest(self.to_toml()?.as_bytes());
        Ok(hex_digest(&digest))
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = self.to_toml()?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Shared argument checks for both trainers.
pub(crate) fn validate_training_inputs(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
) -> Result<(), TrainingError> {
    if x.nrows() == 0 {
        return Err(TrainingError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(TrainingError::DimensionMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    if x.ncols() != feature_names.len() {
        return Err(TrainingError::FeatureCountMismatch {
            expected: x.ncols(),
            found: feature_names.len(),
        });
    }
    if let Some(&bad) = y.iter().find(|&&v| v != 0.0 && v != 1.0) {
        return Err(TrainingError::NonBinaryLabel(bad));
    }
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    let classes = usize::from(positives > 0) + usize::from(positives < y.len());
    if classes < 2 {
        return Err(TrainingError::SingleClass { classes });
    }
    Ok(())
}
