//! Exact margin-space attributions of one row against one reference row.
//!
//! For a reference `z`, the attributions of `x` sum to `margin(x) - margin(z)`.
//! Linear models attribute `beta_j * (x_j - z_j)` on the standardized scale.
//! Tree ensembles use the interventional TreeSHAP recursion: walking both rows
//! down a tree, every split where they disagree assigns its feature to the side
//! taken, and each reachable leaf distributes its value over the assigned
//! features with Shapley weights.

use crate::boost::{BoostedEnsemble, TreeNode};
use crate::linear::LogisticModel;
use crate::model::TrainedModel;
use ndarray::ArrayView1;

const FACTORIAL_TABLE_LEN: usize = 65;

const FACTORIALS: [f64; FACTORIAL_TABLE_LEN] = {
    let mut table = [1.0; FACTORIAL_TABLE_LEN];
    let mut i = 1;
    while i < FACTORIAL_TABLE_LEN {
        table[i] = table[i - 1] * i as f64;
        i += 1;
    }
    table
};

#[inline]
fn factorial(n: usize) -> f64 {
    if n < FACTORIAL_TABLE_LEN {
        FACTORIALS[n]
    } else {
        (1..=n).map(|k| k as f64).product()
    }
}

/// Adds the attributions of `x` against `reference` into `out`.
pub(crate) fn accumulate(
    model: &TrainedModel,
    x: ArrayView1<f64>,
    reference: ArrayView1<f64>,
    out: &mut [f64],
) {
    match model {
        TrainedModel::Logistic(m) => linear(m, x, reference, out),
        TrainedModel::Boosted(m) => ensemble(m, x, reference, out),
    }
}

fn linear(model: &LogisticModel, x: ArrayView1<f64>, reference: ArrayView1<f64>, out: &mut [f64]) {
    let scaler = model.scaler();
    for (j, slot) in out.iter_mut().enumerate() {
        let xv = if x[j].is_nan() { 0.0 } else { x[j] };
        let zv = if reference[j].is_nan() { 0.0 } else { reference[j] };
        *slot += model.coefficients()[j] * (xv - zv) / scaler.scales[j];
    }
}

fn ensemble(
    model: &BoostedEnsemble,
    x: ArrayView1<f64>,
    reference: ArrayView1<f64>,
    out: &mut [f64],
) {
    let mut from_x = Vec::new();
    let mut from_reference = Vec::new();
    for tree in model.trees() {
        walk(
            tree.nodes(),
            0,
            x,
            reference,
            &mut from_x,
            &mut from_reference,
            out,
        );
    }
}

fn walk(
    nodes: &[TreeNode],
    index: usize,
    x: ArrayView1<f64>,
    reference: ArrayView1<f64>,
    from_x: &mut Vec<usize>,
    from_reference: &mut Vec<usize>,
    out: &mut [f64],
) {
    let node = &nodes[index];
    if node.is_leaf {
        let (a, b) = (from_x.len(), from_reference.len());
        let total = factorial(a + b);
        if a > 0 {
            let w = factorial(a - 1) * factorial(b) / total * node.value;
            for &f in from_x.iter() {
                out[f] += w;
            }
        }
        if b > 0 {
            let w = factorial(a) * factorial(b - 1) / total * node.value;
            for &f in from_reference.iter() {
                out[f] -= w;
            }
        }
        return;
    }

    let feature = node.feature;
    let x_child = node.child_for(x[feature]);
    let reference_child = node.child_for(reference[feature]);
    if x_child == reference_child {
        walk(nodes, x_child, x, reference, from_x, from_reference, out);
    } else if from_x.contains(&feature) {
        walk(nodes, x_child, x, reference, from_x, from_reference, out);
    } else if from_reference.contains(&feature) {
        walk(nodes, reference_child, x, reference, from_x, from_reference, out);
    } else {
        from_x.push(feature);
        walk(nodes, x_child, x, reference, from_x, from_reference, out);
        from_x.pop();
        from_reference.push(feature);
        walk(nodes, reference_child, x, reference, from_x, from_reference, out);
        from_reference.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::BoostParams;
    use crate::linear::LogisticConfig;
    use crate::model::Classifier;
    use crate::test_fixtures::{feature_names, labelled_matrix};
    use approx::assert_abs_diff_eq;

    #[test]
    fn factorials_are_exact_for_small_n() {
        assert_eq!(factorial(0), 1.0);
        assert_eq!(factorial(5), 120.0);
        assert_eq!(factorial(10), 3_628_800.0);
    }

    #[test]
    fn tree_attributions_sum_to_margin_difference() {
        let (mut x, y) = labelled_matrix(400, 31);
        x[[5, 1]] = f64::NAN;
        let params = BoostParams {
            n_estimators: 25,
            max_depth: 4,
            ..BoostParams::default()
        };
        let model: TrainedModel = BoostedEnsemble::fit(x.view(), y.view(), &feature_names(4), &params)
            .unwrap()
            .into();
        for (i, r) in [(5, 0), (1, 2), (3, 3), (10, 200)] {
            let mut phi = vec![0.0; 4];
            accumulate(&model, x.row(i), x.row(r), &mut phi);
            let expected = model.margin(x.row(i)) - model.margin(x.row(r));
            assert_abs_diff_eq!(phi.iter().sum::<f64>(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn identical_rows_get_zero_attribution() {
        let (x, y) = labelled_matrix(200, 2);
        let model: TrainedModel =
            BoostedEnsemble::fit(x.view(), y.view(), &feature_names(4), &BoostParams::default())
                .unwrap()
                .into();
        let mut phi = vec![0.0; 4];
        accumulate(&model, x.row(7), x.row(7), &mut phi);
        assert!(phi.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn features_off_the_path_get_nothing() {
        // Only feature 0 differs, so only it can receive credit.
        let (x, y) = labelled_matrix(300, 9);
        let model: TrainedModel =
            BoostedEnsemble::fit(x.view(), y.view(), &feature_names(4), &BoostParams::default())
                .unwrap()
                .into();
        let row = x.row(0).to_owned();
        let mut reference = row.clone();
        reference[0] += 1.5;
        let mut phi = vec![0.0; 4];
        accumulate(&model, row.view(), reference.view(), &mut phi);
        assert_eq!(&phi[1..], &[0.0, 0.0, 0.0]);
        assert_abs_diff_eq!(
            phi[0],
            model.margin(row.view()) - model.margin(reference.view()),
            epsilon = 1e-9
        );
    }

    #[test]
    fn linear_attributions_are_coefficient_times_difference() {
        let (x, y) = labelled_matrix(300, 10);
        let logistic =
            LogisticModel::fit(x.view(), y.view(), &feature_names(4), &LogisticConfig::default())
                .unwrap();
        let (raw, _) = logistic.raw_coefficients();
        let model: TrainedModel = logistic.into();
        let mut phi = vec![0.0; 4];
        accumulate(&model, x.row(0), x.row(1), &mut phi);
        for j in 0..4 {
            assert_abs_diff_eq!(phi[j], raw[j] * (x[[0, j]] - x[[1, j]]), epsilon = 1e-10);
        }
    }
}
