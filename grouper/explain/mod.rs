//! # Explainability Engine
//!
//! Per-row SHAP-style attributions in probability space for either model
//! family. An [`Explainer`] holds a bounded background sample from the training
//! partition; every row is attributed against each background row and the
//! results are averaged, so that
//!
//! ```text
//! base_value + sum(contributions) == predicted probability
//! ```
//!
//! up to floating-point error, which is reported per row as the
//! reconstruction error.

mod attribution;
pub mod cache;
pub mod factors;

pub use cache::{ExplainerCache, cache_key};
pub use factors::{
    Factor, FactorOptions, GlobalFactor, LocalExplanation, ReconstructionSummary, global_factors,
    local_factors,
};

use crate::model::{ModelError, ModelKind, TrainedModel};
use crate::sigmoid;
use log::{debug, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below this margin gap the secant slope is replaced by the sigmoid derivative.
const MARGIN_GAP_EPSILON: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum ExplainError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("I/O error while accessing the explainer cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the explainer to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("The explainer background sample is empty; at least one training row is required.")]
    EmptyBackground,
    #[error(
        "The explainer was built for a {expected} model with fingerprint {expected_fingerprint}, but was asked to explain a {found} model with fingerprint {found_fingerprint}."
    )]
    ModelMismatch {
        expected: ModelKind,
        expected_fingerprint: String,
        found: ModelKind,
        found_fingerprint: String,
    },
}

/// Probability-space attribution of one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowAttribution {
    pub base_value: f64,
    /// One entry per model feature, in model order.
    pub contributions: Vec<f64>,
    pub predicted: f64,
    /// `|base_value + sum(contributions) - predicted|`.
    pub reconstruction_error: f64,
}

/// A model-specific explainer over a fixed background sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explainer {
    pub cache_key: String,
    pub model_kind: ModelKind,
    pub model_fingerprint: String,
    pub feature_names: Vec<String>,
    base_value: f64,
    background: Array2<f64>,
    background_margins: Array1<f64>,
}

impl Explainer {
    /// Builds an explainer for `model` over `background` (rows in model
    /// feature order).
    pub fn build(model: &TrainedModel, background: Array2<f64>) -> Result<Self, ExplainError> {
        if background.nrows() == 0 {
            return Err(ExplainError::EmptyBackground);
        }
        let background_margins = model.predict_margin(background.view())?;
        let base_value = background_margins.mapv(sigmoid).mean().unwrap_or(0.0);
        let cache_key = cache_key(model, background.view())?;
        debug!(
            "Built {} explainer over {} background rows (base value {:.4}).",
            model.kind(),
            background.nrows(),
            base_value
        );
        Ok(Self {
            cache_key,
            model_kind: model.kind(),
            model_fingerprint: model.fingerprint()?,
            feature_names: model.feature_names().to_vec(),
            base_value,
            background,
            background_margins,
        })
    }

    /// Mean predicted probability over the background sample.
    pub fn base_value(&self) -> f64 {
        self.base_value
    }

    pub fn background(&self) -> ArrayView2<'_, f64> {
        self.background.view()
    }

    /// Attributions for every row of `x`, in row order. Rows that are entirely
    /// null, or whose attribution is not finite, come back as `None`.
    pub fn explain(
        &self,
        model: &TrainedModel,
        x: ArrayView2<f64>,
    ) -> Result<Vec<Option<RowAttribution>>, ExplainError> {
        let fingerprint = model.fingerprint()?;
        if model.kind() != self.model_kind || fingerprint != self.model_fingerprint {
            return Err(ExplainError::ModelMismatch {
                expected: self.model_kind,
                expected_fingerprint: self.model_fingerprint.clone(),
                found: model.kind(),
                found_fingerprint: fingerprint,
            });
        }
        if x.ncols() != self.feature_names.len() {
            return Err(ModelError::FeatureCountMismatch {
                expected: self.feature_names.len(),
                found: x.ncols(),
            }
            .into());
        }

        let rows: Vec<Option<RowAttribution>> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                if row.iter().all(|v| v.is_nan()) {
                    return None;
                }
                let attribution = self.explain_row(model, row);
                let finite = attribution.contributions.iter().all(|c| c.is_finite())
                    && attribution.predicted.is_finite();
                finite.then_some(attribution)
            })
            .collect();

        let failed = rows.iter().filter(|r| r.is_none()).count();
        if failed > 0 {
            warn!(
                "{} of {} rows could not be attributed by the {} explainer; placeholders were emitted.",
                failed,
                rows.len(),
                self.model_kind
            );
        }
        Ok(rows)
    }

    fn explain_row(&self, model: &TrainedModel, row: ArrayView1<f64>) -> RowAttribution {
        let p = self.feature_names.len();
        let margin = model.margin(row);
        let predicted = sigmoid(margin);

        let mut total = vec![0.0; p];
        let mut scratch = vec![0.0; p];
        for (reference, &reference_margin) in self
            .background
            .axis_iter(Axis(0))
            .zip(self.background_margins.iter())
        {
            scratch.iter_mut().for_each(|v| *v = 0.0);
            attribution::accumulate(model, row, reference, &mut scratch);
            let gap = margin - reference_margin;
            let slope = if gap.abs() > MARGIN_GAP_EPSILON {
                (predicted - sigmoid(reference_margin)) / gap
            } else {
                predicted * (1.0 - predicted)
            };
            for (t, s) in total.iter_mut().zip(&scratch) {
                *t += slope * s;
            }
        }
        let count = self.background.nrows() as f64;
        total.iter_mut().for_each(|t| *t /= count);

        let reconstructed = self.base_value + total.iter().sum::<f64>();
        RowAttribution {
            base_value: self.base_value,
            contributions: total,
            predicted,
            reconstruction_error: (reconstructed - predicted).abs(),
        }
    }
}

/// Draws at most `cap` rows of `x` without replacement, keeping their
/// original order. Returns every row when `x` has no more than `cap`.
pub fn sample_background(x: ArrayView2<f64>, cap: usize, seed: u64) -> Array2<f64> {
    if x.nrows() <= cap {
        return x.to_owned();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = rand::seq::index::sample(&mut rng, x.nrows(), cap).into_vec();
    rows.sort_unstable();
    x.select(Axis(0), &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::{BoostParams, BoostedEnsemble};
    use crate::linear::{LogisticConfig, LogisticModel};
    use crate::model::Classifier;
    use crate::test_fixtures::{feature_names, labelled_matrix};
    use approx::assert_abs_diff_eq;

    fn boosted(seed: u64) -> (TrainedModel, Array2<f64>) {
        let (x, y) = labelled_matrix(300, seed);
        let params = BoostParams {
            n_estimators: 20,
            max_depth: 3,
            ..BoostParams::default()
        };
        let model = BoostedEnsemble::fit(x.view(), y.view(), &feature_names(4), &params).unwrap();
        (model.into(), x)
    }

    #[test]
    fn contributions_reconstruct_boosted_probabilities() {
        let (model, x) = boosted(3);
        let explainer = Explainer::build(&model, sample_background(x.view(), 40, 1)).unwrap();
        let rows = explainer.explain(&model, x.slice(ndarray::s![..25, ..])).unwrap();
        let probabilities = model.predict_probability(x.slice(ndarray::s![..25, ..])).unwrap();
        for (row, p) in rows.iter().zip(probabilities.iter()) {
            let row = row.as_ref().unwrap();
            assert_abs_diff_eq!(row.predicted, *p, epsilon = 1e-12);
            assert!(row.reconstruction_error < 1e-9, "{}", row.reconstruction_error);
        }
    }

    #[test]
    fn contributions_reconstruct_logistic_probabilities() {
        let (x, y) = labelled_matrix(300, 4);
        let model: TrainedModel =
            LogisticModel::fit(x.view(), y.view(), &feature_names(4), &LogisticConfig::default())
                .unwrap()
                .into();
        let explainer = Explainer::build(&model, sample_background(x.view(), 50, 2)).unwrap();
        for row in explainer.explain(&model, x.view()).unwrap() {
            assert!(row.unwrap().reconstruction_error < 1e-9);
        }
    }

    #[test]
    fn null_rows_become_placeholders_without_stopping_the_batch() {
        let (model, mut x) = boosted(5);
        x.row_mut(1).fill(f64::NAN);
        let explainer = Explainer::build(&model, sample_background(x.view(), 20, 1)).unwrap();
        let rows = explainer.explain(&model, x.slice(ndarray::s![..3, ..])).unwrap();
        assert!(rows[0].is_some());
        assert!(rows[1].is_none());
        assert!(rows[2].is_some());
    }

    #[test]
    fn explainer_refuses_a_different_model() {
        let (model, x) = boosted(6);
        let (other, _) = boosted(7);
        let explainer = Explainer::build(&model, sample_background(x.view(), 10, 1)).unwrap();
        assert!(matches!(
            explainer.explain(&other, x.view()),
            Err(ExplainError::ModelMismatch { .. })
        ));
    }

    #[test]
    fn background_sampling_is_bounded_and_seeded() {
        let (x, _) = labelled_matrix(100, 1);
        let a = sample_background(x.view(), 30, 9);
        let b = sample_background(x.view(), 30, 9);
        assert_eq!(a.nrows(), 30);
        assert_eq!(a, b);
        assert_eq!(sample_background(x.view(), 500, 9).nrows(), 100);
    }

    #[test]
    fn empty_background_is_rejected() {
        let (model, _) = boosted(8);
        assert!(matches!(
            Explainer::build(&model, Array2::zeros((0, 4))),
            Err(ExplainError::EmptyBackground)
        ));
    }
}
