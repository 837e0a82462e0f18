//! Hyperparameter search for the boosted ensemble.
//!
//! Candidates are scored by mean ROC-AUC over stratified folds of the training
//! partition only. Candidate generation is sequential from a seeded generator and
//! evaluation runs in parallel; results are gathered in candidate order and ties
//! go to the earliest candidate, so a fixed seed always selects the same
//! parameters.

use super::ensemble::{BoostParams, BoostedEnsemble, log_feature_importance, positive_class_weight};
use crate::metrics::roc_auc;
use crate::model::{Classifier, TrainingError, validate_training_inputs};
use itertools::iproduct;
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Sample `candidates` points from the search space.
    Randomized,
    /// Evaluate the full grid.
    Grid,
    /// Fit the base parameters directly.
    Disabled,
}

/// Bounds of the randomized search and values of the grid search. Integer
/// ranges are half-open, float ranges are `[low, high]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub n_estimators: (usize, usize),
    pub max_depth: (usize, usize),
    pub learning_rate: (f64, f64),
    pub subsample: (f64, f64),
    pub colsample_bytree: (f64, f64),
    pub min_split_loss: (f64, f64),
    pub reg_alpha: (f64, f64),
    pub reg_lambda: (f64, f64),
    pub grid_n_estimators: Vec<usize>,
    pub grid_max_depth: Vec<usize>,
    pub grid_learning_rate: Vec<f64>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            n_estimators: (50, 300),
            max_depth: (3, 10),
            learning_rate: (0.01, 0.31),
            subsample: (0.6, 1.0),
            colsample_bytree: (0.6, 1.0),
            min_split_loss: (0.0, 0.5),
            reg_alpha: (0.0, 1.0),
            reg_lambda: (0.0, 1.0),
            grid_n_estimators: vec![100, 200, 300],
            grid_max_depth: vec![5, 7, 9],
            grid_learning_rate: vec![0.1, 0.05, 0.01],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy: SearchStrategy,
    /// Number of sampled candidates for the randomized strategy.
    pub candidates: usize,
    pub folds: usize,
    pub seed: u64,
    pub space: SearchSpace,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Randomized,
            candidates: 20,
            folds: 3,
            seed: 42,
            space: SearchSpace::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: BoostParams,
    /// Mean ROC-AUC over folds where it is defined; `None` if it never was.
    pub mean_auc: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best: BoostParams,
    pub best_auc: Option<f64>,
    pub folds: usize,
    pub candidates: Vec<CandidateScore>,
}

/// Fits the boosted ensemble on the training partition, searching
/// hyperparameters first when configured.
///
/// When `balance_classes` is set the positive-class weight
/// (`negatives / positives`) is written into every candidate and into the final
/// model's parameters.
pub fn train_boosted(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
    base: &BoostParams,
    search: &SearchConfig,
    balance_classes: bool,
) -> Result<(BoostedEnsemble, Option<SearchOutcome>), TrainingError> {
    validate_training_inputs(x, y, feature_names)?;
    let mut base = base.clone();
    base.scale_pos_weight = if balance_classes {
        positive_class_weight(y)
    } else {
        1.0
    };
    info!("Boosted ensemble scale_pos_weight = {:.4}", base.scale_pos_weight);

    let outcome = match search.strategy {
        SearchStrategy::Disabled => None,
        _ => search_hyperparameters(x, y, feature_names, &base, search),
    };
    let params = outcome.as_ref().map_or_else(|| base.clone(), |o| o.best.clone());
    let model = BoostedEnsemble::fit(x, y, feature_names, &params)?;
    log_feature_importance(&model, 10);
    Ok((model, outcome))
}

/// Evaluates candidates by stratified cross-validation. Returns `None` when the
/// minority class is too small to stratify.
pub fn search_hyperparameters(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
    base: &BoostParams,
    config: &SearchConfig,
) -> Option<SearchOutcome> {
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    let minority = positives.min(y.len() - positives);
    let folds = config.folds.min(minority);
    if folds < 2 {
        warn!(
            "Skipping hyperparameter search: the minority class has {minority} row(s), fewer than two folds."
        );
        return None;
    }

    let candidates = match config.strategy {
        SearchStrategy::Grid => grid_candidates(base, &config.space),
        _ => random_candidates(base, &config.space, config.candidates, config.seed),
    };
    if candidates.is_empty() {
        return None;
    }
    let assignment = stratified_folds(y, folds, config.seed);
    info!(
        "Evaluating {} hyperparameter candidates with {}-fold stratified cross-validation.",
        candidates.len(),
        folds
    );

    let scores: Vec<CandidateScore> = candidates
        .into_par_iter()
        .map(|params| {
            let mean_auc = cross_validated_auc(x, y, feature_names, &assignment, folds, &params);
            CandidateScore { params, mean_auc }
        })
        .collect();

    let mut best_index = 0;
    for (i, candidate) in scores.iter().enumerate() {
        debug!("Candidate {i}: mean AUC {:?} for {:?}", candidate.mean_auc, candidate.params);
        let better = match (candidate.mean_auc, scores[best_index].mean_auc) {
            (Some(score), Some(best)) => score > best,
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best_index = i;
        }
    }
    let best = scores[best_index].params.clone();
    let best_auc = scores[best_index].mean_auc;
    info!(
        "Selected n_estimators={}, max_depth={}, learning_rate={:.4}, subsample={:.3}, colsample_bytree={:.3}, gamma={:.3}, reg_alpha={:.3}, reg_lambda={:.3} (cross-validated AUC {})",
        best.n_estimators,
        best.max_depth,
        best.learning_rate,
        best.subsample,
        best.colsample_bytree,
        best.min_split_loss,
        best.reg_alpha,
        best.reg_lambda,
        best_auc.map_or_else(|| "undefined".to_string(), |a| format!("{a:.4}"))
    );
    Some(SearchOutcome {
        best,
        best_auc,
        folds,
        candidates: scores,
    })
}

/// Fold index per row. Each class is shuffled separately and dealt round-robin,
/// so every fold holds both classes whenever each class has at least `k` rows.
pub fn stratified_folds(y: ArrayView1<f64>, k: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut assignment = vec![0; y.len()];
    for class in [1.0, 0.0] {
        let mut rows: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        rows.shuffle(&mut rng);
        for (position, row) in rows.into_iter().enumerate() {
            assignment[row] = position % k;
        }
    }
    assignment
}

fn random_candidates(
    base: &BoostParams,
    space: &SearchSpace,
    count: usize,
    seed: u64,
) -> Vec<BoostParams> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| BoostParams {
            n_estimators: integer_in(&mut rng, space.n_estimators),
            max_depth: integer_in(&mut rng, space.max_depth),
            learning_rate: float_in(&mut rng, space.learning_rate),
            subsample: float_in(&mut rng, space.subsample),
            colsample_bytree: float_in(&mut rng, space.colsample_bytree),
            min_split_loss: float_in(&mut rng, space.min_split_loss),
            reg_alpha: float_in(&mut rng, space.reg_alpha),
            reg_lambda: float_in(&mut rng, space.reg_lambda),
            ..base.clone()
        })
        .collect()
}

fn integer_in(rng: &mut StdRng, (low, high): (usize, usize)) -> usize {
    if high > low { rng.gen_range(low..high) } else { low }
}

fn float_in(rng: &mut StdRng, (low, high): (f64, f64)) -> f64 {
    if high > low { rng.gen_range(low..=high) } else { low }
}

fn grid_candidates(base: &BoostParams, space: &SearchSpace) -> Vec<BoostParams> {
    iproduct!(
        space.grid_n_estimators.iter(),
        space.grid_max_depth.iter(),
        space.grid_learning_rate.iter()
    )
    .map(|(&n_estimators, &max_depth, &learning_rate)| BoostParams {
        n_estimators,
        max_depth,
        learning_rate,
        ..base.clone()
    })
    .collect()
}

fn cross_validated_auc(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
    assignment: &[usize],
    folds: usize,
    params: &BoostParams,
) -> Option<f64> {
    let mut total = 0.0;
    let mut scored = 0;
    for fold in 0..folds {
        let (held, kept): (Vec<usize>, Vec<usize>) =
            (0..y.len()).partition(|&i| assignment[i] == fold);
        let train_x = x.select(Axis(0), &kept);
        let train_y: Array1<f64> = y.select(Axis(0), &kept);
        let model = match BoostedEnsemble::fit(train_x.view(), train_y.view(), feature_names, params)
        {
            Ok(model) => model,
            Err(err) => {
                debug!("Fold {fold} skipped: {err}");
                continue;
            }
        };
        let held_x = x.select(Axis(0), &held);
        let held_y = y.select(Axis(0), &held);
        let margins = model.predict_margin(held_x.view());
        if let Some(auc) = roc_auc(held_y.view(), margins.view()) {
            total += auc;
            scored += 1;
        }
    }
    (scored > 0).then(|| total / scored as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{feature_names, labelled_matrix};
    use ndarray::Array1;

    fn quick_search(strategy: SearchStrategy) -> SearchConfig {
        SearchConfig {
            strategy,
            candidates: 3,
            folds: 3,
            seed: 42,
            space: SearchSpace {
                n_estimators: (5, 15),
                max_depth: (2, 4),
                grid_n_estimators: vec![5, 10],
                grid_max_depth: vec![2],
                grid_learning_rate: vec![0.3],
                ..SearchSpace::default()
            },
        }
    }

    #[test]
    fn folds_are_stratified() {
        let y = Array1::from_iter((0..90).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }));
        let folds = stratified_folds(y.view(), 3, 1);
        for fold in 0..3 {
            let rows: Vec<usize> = (0..90).filter(|&i| folds[i] == fold).collect();
            assert_eq!(rows.len(), 30);
            assert_eq!(rows.iter().filter(|&&i| y[i] == 1.0).count(), 10);
        }
    }

    #[test]
    fn randomized_candidates_stay_in_bounds() {
        let space = SearchSpace::default();
        let candidates = random_candidates(&BoostParams::default(), &space, 50, 7);
        assert_eq!(candidates.len(), 50);
        for c in &candidates {
            assert!((50..300).contains(&c.n_estimators));
            assert!((3..10).contains(&c.max_depth));
            assert!((0.01..=0.31).contains(&c.learning_rate));
            assert!((0.6..=1.0).contains(&c.subsample));
            assert!((0.6..=1.0).contains(&c.colsample_bytree));
            assert!((0.0..=0.5).contains(&c.min_split_loss));
            assert_eq!(c.max_bins, 256);
        }
    }

    #[test]
    fn grid_covers_every_combination() {
        let grid = grid_candidates(&BoostParams::default(), &SearchSpace::default());
        assert_eq!(grid.len(), 27);
        assert_eq!(grid[0].n_estimators, 100);
        assert_eq!(grid[0].learning_rate, 0.1);
    }

    #[test]
    fn positive_weight_reaches_the_trained_parameters() {
        let mut y = vec![0.0; 900];
        y.extend(vec![1.0; 100]);
        let y = Array1::from_vec(y);
        let (x, _) = labelled_matrix(1000, 5);
        let base = BoostParams {
            n_estimators: 5,
            max_depth: 2,
            ..BoostParams::default()
        };
        let (model, outcome) = train_boosted(
            x.view(),
            y.view(),
            &feature_names(4),
            &base,
            &quick_search(SearchStrategy::Randomized),
            true,
        )
        .unwrap();
        assert!((model.params().scale_pos_weight - 9.0).abs() < 1e-12);
        let outcome = outcome.unwrap();
        assert!(outcome.candidates.iter().all(|c| c.params.scale_pos_weight == 9.0));

        let (unweighted, _) = train_boosted(
            x.view(),
            y.view(),
            &feature_names(4),
            &base,
            &quick_search(SearchStrategy::Disabled),
            false,
        )
        .unwrap();
        assert_eq!(unweighted.params().scale_pos_weight, 1.0);
    }

    #[test]
    fn search_is_deterministic() {
        let (x, y) = labelled_matrix(300, 12);
        let names = feature_names(4);
        let config = quick_search(SearchStrategy::Grid);
        let a = search_hyperparameters(x.view(), y.view(), &names, &BoostParams::default(), &config)
            .unwrap();
        let b = search_hyperparameters(x.view(), y.view(), &names, &BoostParams::default(), &config)
            .unwrap();
        assert_eq!(a.best, b.best);
        assert_eq!(a.candidates.len(), 2);
        assert!(a.best_auc.unwrap() > 0.5);
    }

    #[test]
    fn tiny_minority_skips_search() {
        let (x, _) = labelled_matrix(20, 1);
        let mut y = Array1::zeros(20);
        y[3] = 1.0;
        assert!(
            search_hyperparameters(
                x.view(),
                y.view(),
                &feature_names(4),
                &BoostParams::default(),
                &SearchConfig::default()
            )
            .is_none()
        );
    }
}
