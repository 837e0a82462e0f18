//! Gradient-boosted tree ensemble on the logistic loss.

use super::tree::{FeatureBinner, RegressionTree, TreeGrower, TreeParams};
use crate::model::{Classifier, TrainingError, validate_training_inputs};
use crate::sigmoid;
use itertools::Itertools;
use log::{debug, info};
use ndarray::parallel::prelude::*;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Hyperparameters of a boosted ensemble. Names follow the conventional
/// gradient-boosting vocabulary (`gamma` is `min_split_loss`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Fraction of rows sampled (per row, independently) for each tree.
    pub subsample: f64,
    /// Fraction of features sampled for each tree.
    pub colsample_bytree: f64,
    pub min_split_loss: f64,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
    pub min_child_weight: f64,
    /// Weight applied to every positive row's gradient and hessian.
    pub scale_pos_weight: f64,
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.3,
            subsample: 1.0,
            colsample_bytree: 1.0,
            min_split_loss: 0.0,
            reg_alpha: 0.0,
            reg_lambda: 1.0,
            min_child_weight: 1.0,
            scale_pos_weight: 1.0,
            max_bins: 256,
            seed: 42,
        }
    }
}

impl BoostParams {
    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth,
            learning_rate: self.learning_rate,
            min_split_loss: self.min_split_loss,
            reg_alpha: self.reg_alpha,
            reg_lambda: self.reg_lambda,
            min_child_weight: self.min_child_weight,
        }
    }
}

/// `negatives / positives`, or 1 when there are no positive rows.
pub fn positive_class_weight(y: ArrayView1<f64>) -> f64 {
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    if positives == 0 {
        return 1.0;
    }
    (y.len() - positives) as f64 / positives as f64
}

/// A fitted boosted ensemble: `margin = base_margin + sum(tree outputs)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    feature_names: Vec<String>,
    params: BoostParams,
    base_margin: f64,
    trees: Vec<RegressionTree>,
}

impl BoostedEnsemble {
    /// The parameters the ensemble was fitted with.
    pub fn params(&self) -> &BoostParams {
        &self.params
    }

    pub fn base_margin(&self) -> f64 {
        self.base_margin
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Total split gain per feature, normalized to sum to one, sorted descending.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut totals = vec![0.0; self.feature_names.len()];
        for node in self.trees.iter().flat_map(|t| t.nodes()) {
            if !node.is_leaf {
                totals[node.feature] += node.gain;
            }
        }
        let sum: f64 = totals.iter().sum();
        self.feature_names
            .iter()
            .cloned()
            .zip(totals)
            .map(|(name, gain)| (name, if sum > 0.0 { gain / sum } else { 0.0 }))
            .sorted_by(|a, b| b.1.total_cmp(&a.1))
            .collect()
    }
}

impl Classifier for BoostedEnsemble {
    type Config = BoostParams;

    fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        feature_names: &[String],
        params: &BoostParams,
    ) -> Result<Self, TrainingError> {
        validate_training_inputs(x, y, feature_names)?;
        let n = x.nrows();
        let p = x.ncols();

        let binner = FeatureBinner::fit(x, params.max_bins);
        let binned = binner.bin_matrix(x);
        let weights: Vec<f64> = y
            .iter()
            .map(|&v| if v == 1.0 { params.scale_pos_weight } else { 1.0 })
            .collect();

        let total_weight: f64 = weights.iter().sum();
        let weighted_positive: f64 = y.iter().zip(&weights).map(|(y, w)| y * w).sum();
        let rate = (weighted_positive / total_weight).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (rate / (1.0 - rate)).ln();

        let mut margins = vec![base_margin; n];
        let mut gradients = vec![0.0; n];
        let mut hessians = vec![0.0; n];
        let mut rng = StdRng::seed_from_u64(params.seed);
        let tree_params = params.tree_params();
        let mut trees = Vec::with_capacity(params.n_estimators);

        for round in 0..params.n_estimators {
            for i in 0..n {
                let prob = sigmoid(margins[i]);
                gradients[i] = weights[i] * (prob - y[i]);
                hessians[i] = (weights[i] * prob * (1.0 - prob)).max(1e-16);
            }

            let mut rows: Vec<usize> = if params.subsample < 1.0 {
                (0..n).filter(|_| rng.gen_bool(params.subsample)).collect()
            } else {
                (0..n).collect()
            };
            if rows.is_empty() {
                rows = (0..n).collect();
            }

            let features: Vec<usize> = if params.colsample_bytree < 1.0 && p > 1 {
                let k = ((params.colsample_bytree * p as f64).round() as usize).clamp(1, p);
                let mut picked = rand::seq::index::sample(&mut rng, p, k).into_vec();
                picked.sort_unstable();
                picked
            } else {
                (0..p).collect()
            };

            let tree = TreeGrower::new(
                &binner,
                &binned,
                &gradients,
                &hessians,
                &features,
                tree_params,
            )
            .grow(rows);

            let updates: Vec<f64> = x
                .axis_iter(Axis(0))
                .into_par_iter()
                .map(|row| tree.predict_row(row))
                .collect();
            for (m, u) in margins.iter_mut().zip(updates) {
                *m += u;
            }
            trees.push(tree);

            if (round + 1) % 25 == 0 {
                let loss = margins
                    .iter()
                    .zip(y.iter())
                    .zip(&weights)
                    .map(|((&m, &t), &w)| {
                        let prob = sigmoid(m).clamp(1e-15, 1.0 - 1e-15);
                        -w * (t * prob.ln() + (1.0 - t) * (1.0 - prob).ln())
                    })
                    .sum::<f64>()
                    / total_weight;
                debug!("Boosting round {}: weighted log-loss {:.6}", round + 1, loss);
            }
        }

        let ensemble = BoostedEnsemble {
            feature_names: feature_names.to_vec(),
            params: params.clone(),
            base_margin,
            trees,
        };
        debug!(
            "Fitted {} trees (scale_pos_weight {:.4}, max depth reached {}).",
            ensemble.trees.len(),
            params.scale_pos_weight,
            ensemble.trees.iter().map(|t| t.depth()).max().unwrap_or(0)
        );
        Ok(ensemble)
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn margin(&self, row: ArrayView1<f64>) -> f64 {
        self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }
}

/// Logs the top features by split gain.
pub fn log_feature_importance(ensemble: &BoostedEnsemble, top: usize) {
    let ranked = ensemble.feature_importance();
    info!(
        "Boosted ensemble top features by gain: {}",
        ranked
            .iter()
            .take(top)
            .map(|(name, share)| format!("{name}={share:.3}"))
            .join(", ")
    );
}
