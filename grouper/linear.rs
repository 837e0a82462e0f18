//! # Regularized Logistic Model
//!
//! Features are standardized with statistics fitted on the training rows, then
//! an L2-penalized logistic model is fitted by penalized iteratively reweighted
//! least squares (Newton's method on the penalized log-likelihood) with step
//! halving. The intercept is not penalized. Null cells are read as zero, both
//! while fitting and while scoring.
//!
//! The objective matches the usual `C`-parameterized form:
//! `sum_i w_i * logloss_i + ||beta||^2 / (2C)` where `w_i` are optional balanced
//! class weights `n / (2 * n_class)`.

use crate::model::{Classifier, TrainingError, validate_training_inputs};
use crate::sigmoid;
use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

const MAX_STEP_HALVINGS: usize = 30;
/// Small ridge added to every diagonal entry so the Newton system stays solvable
/// when the intercept or a constant column is unidentified.
const HESSIAN_JITTER: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticConfig {
    /// Inverse regularization strength (`C`). Smaller is stronger.
    pub inverse_regularization: f64,
    /// Reweight rows so both classes carry equal total weight.
    pub balanced_class_weight: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            inverse_regularization: 1.0,
            balanced_class_weight: true,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// Column means and scales fitted on the training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    /// Population standard deviations; zero-variance columns keep a scale of 1.
    pub scales: Vec<f64>,
}

impl Standardizer {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mut means = Vec::with_capacity(x.ncols());
        let mut scales = Vec::with_capacity(x.ncols());
        for column in x.axis_iter(Axis(1)) {
            let mean = column.iter().map(|&v| fill_null(v)).sum::<f64>() / n;
            let var = column
                .iter()
                .map(|&v| (fill_null(v) - mean).powi(2))
                .sum::<f64>()
                / n;
            let sd = var.sqrt();
            means.push(mean);
            scales.push(if sd > 1e-12 { sd } else { 1.0 });
        }
        Self { means, scales }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut z = x.mapv(fill_null);
        for (j, mut column) in z.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, scale) = (self.means[j], self.scales[j]);
            column.mapv_inplace(|v| (v - mean) / scale);
        }
        z
    }
}

#[inline]
fn fill_null(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
}

/// A fitted L2-regularized logistic model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    feature_names: Vec<String>,
    scaler: Standardizer,
    /// Coefficients on the standardized scale, in feature order.
    coefficients: Vec<f64>,
    intercept: f64,
    pub iterations: usize,
    pub status: FitStatus,
}

/// One feature's share of a logistic score, on the original feature scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTerm {
    pub feature: String,
    /// The raw value, `None` when null (scored as zero).
    pub value: Option<f64>,
    pub coefficient: f64,
    pub contribution: f64,
}

/// The additive build-up of a logistic score: `intercept + sum(terms) = margin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBuildUp {
    pub intercept: f64,
    pub terms: Vec<ScoreTerm>,
    pub total_margin: f64,
    pub probability: f64,
}

impl LogisticModel {
    /// Coefficients on the standardized scale.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Intercept on the standardized scale.
    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn scaler(&self) -> &Standardizer {
        &self.scaler
    }

    /// Coefficients and intercept expressed on the original feature scale.
    pub fn raw_coefficients(&self) -> (Vec<f64>, f64) {
        let raw: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&self.scaler.scales)
            .map(|(b, s)| b / s)
            .collect();
        let shift: f64 = raw.iter().zip(&self.scaler.means).map(|(b, m)| b * m).sum();
        (raw, self.intercept - shift)
    }

    /// The per-feature build-up of this row's score.
    pub fn score_build_up(&self, row: ArrayView1<f64>) -> ScoreBuildUp {
        let (raw, intercept) = self.raw_coefficients();
        let terms: Vec<ScoreTerm> = self
            .feature_names
            .iter()
            .zip(raw)
            .zip(row.iter())
            .map(|((feature, coefficient), &value)| ScoreTerm {
                feature: feature.clone(),
                value: (!value.is_nan()).then_some(value),
                coefficient,
                contribution: coefficient * fill_null(value),
            })
            .collect();
        let total_margin = intercept + terms.iter().map(|t| t.contribution).sum::<f64>();
        ScoreBuildUp {
            intercept,
            terms,
            total_margin,
            probability: sigmoid(total_margin),
        }
    }

    fn log_coefficients(&self) {
        let ranked = self
            .feature_names
            .iter()
            .zip(&self.coefficients)
            .sorted_by(|a, b| b.1.abs().total_cmp(&a.1.abs()))
            .collect::<Vec<_>>();
        info!(
            "Logistic intercept {:.4}; strongest standardized coefficients: {}",
            self.intercept,
            ranked
                .iter()
                .take(10)
                .map(|(name, b)| format!("{name}={b:.4}"))
                .join(", ")
        );
        for (name, b) in &ranked {
            debug!("  coefficient {name}: {b:.6}");
        }
    }
}

impl Classifier for LogisticModel {
    type Config = LogisticConfig;

    fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        feature_names: &[String],
        config: &LogisticConfig,
    ) -> Result<Self, TrainingError> {
        validate_training_inputs(x, y, feature_names)?;
        let n = x.nrows();
        let p = x.ncols();

        let scaler = Standardizer::fit(x);
        let z = scaler.transform(x);
        let mut design = Array2::<f64>::ones((n, p + 1));
        design.slice_mut(s![.., 1..]).assign(&z);

        let weights = internal::sample_weights(y, config.balanced_class_weight);
        let lambda = 1.0 / config.inverse_regularization;

        let mut theta = Array1::<f64>::zeros(p + 1);
        theta[0] = internal::prior_log_odds(y, weights.view());
        let mut objective = internal::penalized_loss(&design, y, &weights, &theta, lambda);
        let mut status = FitStatus::MaxIterationsReached;
        let mut iterations = 0;

        for iter in 1..=config.max_iterations {
            iterations = iter;
            let eta = design.dot(&theta);
            let mu = eta.mapv(sigmoid);

            let residual = (&mu - &y) * &weights;
            let mut gradient = design.t().dot(&residual);
            let mut penalty = theta.clone();
            penalty[0] = 0.0;
            gradient.scaled_add(lambda, &penalty);

            let working = (&mu * &mu.mapv(|m| 1.0 - m) * &weights).insert_axis(Axis(1));
            let weighted_design = &design * &working;
            let mut hessian = design.t().dot(&weighted_design);
            for j in 0..=p {
                hessian[[j, j]] += HESSIAN_JITTER + if j == 0 { 0.0 } else { lambda };
            }
            let step = hessian.solve_into(gradient)?;

            let mut scale = 1.0;
            let mut halvings = 0;
            let (candidate, candidate_objective) = loop {
                let trial = &theta - &(&step * scale);
                let trial_objective = internal::penalized_loss(&design, y, &weights, &trial, lambda);
                if trial_objective.is_finite() && trial_objective <= objective {
                    break (trial, trial_objective);
                }
                halvings += 1;
                if halvings >= MAX_STEP_HALVINGS {
                    break (theta.clone(), objective);
                }
                scale *= 0.5;
            };
            if halvings > 0 {
                debug!("Iteration {iter}: step halved {halvings} time(s).");
            }

            let change = (objective - candidate_objective).abs();
            debug!("Iteration {iter}: penalized loss {candidate_objective:.8e} (change {change:.3e})");
            theta = candidate;
            objective = candidate_objective;
            if change <= config.tolerance * (objective.abs() + 1.0) {
                status = FitStatus::Converged;
                break;
            }
        }

        if status == FitStatus::MaxIterationsReached {
            warn!(
                "Logistic model did not converge within {} iterations.",
                config.max_iterations
            );
        } else {
            info!("Logistic model converged after {iterations} iteration(s).");
        }

        let model = LogisticModel {
            feature_names: feature_names.to_vec(),
            scaler,
            coefficients: theta.slice(s![1..]).to_vec(),
            intercept: theta[0],
            iterations,
            status,
        };
        model.log_coefficients();
        Ok(model)
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn margin(&self, row: ArrayView1<f64>) -> f64 {
        self.intercept
            + row
                .iter()
                .zip(&self.coefficients)
                .zip(self.scaler.means.iter().zip(&self.scaler.scales))
                .map(|((&v, b), (m, s))| b * (fill_null(v) - m) / s)
                .sum::<f64>()
    }
}

mod internal {
    use super::*;

    /// Unit weights, or balanced class weights `n / (2 * n_class)`.
    pub(super) fn sample_weights(y: ArrayView1<f64>, balanced: bool) -> Array1<f64> {
        if !balanced {
            return Array1::ones(y.len());
        }
        let n = y.len() as f64;
        let positives = y.iter().filter(|&&v| v == 1.0).count() as f64;
        let negatives = n - positives;
        y.mapv(|v| {
            if v == 1.0 {
                n / (2.0 * positives)
            } else {
                n / (2.0 * negatives)
            }
        })
    }

    pub(super) fn prior_log_odds(y: ArrayView1<f64>, weights: ArrayView1<f64>) -> f64 {
        let total = weights.sum();
        let positive: f64 = y.iter().zip(weights.iter()).map(|(y, w)| y * w).sum();
        let rate = (positive / total).clamp(1e-6, 1.0 - 1e-6);
        (rate / (1.0 - rate)).ln()
    }

    /// Weighted negative log-likelihood plus the ridge penalty on the slopes.
    pub(super) fn penalized_loss(
        design: &Array2<f64>,
        y: ArrayView1<f64>,
        weights: &Array1<f64>,
        theta: &Array1<f64>,
        lambda: f64,
    ) -> f64 {
        let eta = design.dot(theta);
        let loss: f64 = eta
            .iter()
            .zip(y.iter())
            .zip(weights.iter())
            .map(|((&e, &t), &w)| w * (softplus(e) - t * e))
            .sum();
        let ridge: f64 = theta.iter().skip(1).map(|b| b * b).sum();
        loss + 0.5 * lambda * ridge
    }

    /// `ln(1 + e^x)` without overflow.
    fn softplus(x: f64) -> f64 {
        if x > 0.0 {
            x + (-x).exp().ln_1p()
        } else {
            x.exp().ln_1p()
        }
    }
}
