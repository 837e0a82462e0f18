//! # Operating Threshold Selection
//!
//! The threshold of each model is chosen on the validation partition as the
//! point of the precision-recall curve with the highest F1 score.

use crate::metrics::ConfusionCounts;
use ndarray::ArrayView1;
use serde::Serialize;
use thiserror::Error;

/// Guards the F1 denominator when precision and recall are both zero.
const F1_EPSILON: f64 = 1e-10;

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("Cannot choose a threshold from an empty set of labels and scores.")]
    EmptyInput,
    #[error("{labels} labels were provided with {scores} scores.")]
    LengthMismatch { labels: usize, scores: usize },
}

/// Precision and recall at every distinct score, in ascending threshold order.
///
/// `precision` and `recall` carry one extra trailing point (precision 1,
/// recall 0) with no threshold. Thresholds below the first one reaching full
/// recall are dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecisionRecallCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f64>,
}

pub fn precision_recall_curve(
    labels: ArrayView1<f64>,
    scores: ArrayView1<f64>,
) -> Result<PrecisionRecallCurve, ThresholdError> {
    if labels.len() != scores.len() {
        return Err(ThresholdError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(ThresholdError::EmptyInput);
    }

    let n = labels.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    // (threshold, true positives, false positives), by decreasing threshold.
    let mut points: Vec<(f64, usize, usize)> = Vec::new();
    let (mut tp, mut fp) = (0, 0);
    let mut i = 0;
    while i < n {
        let score = scores[order[i]];
        while i < n && scores[order[i]] == score {
            if labels[order[i]] == 1.0 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        points.push((score, tp, fp));
    }

    let total_positives = tp;
    let last = points
        .iter()
        .position(|&(_, tp, _)| tp == total_positives)
        .unwrap_or(points.len() - 1);

    let mut curve = PrecisionRecallCurve {
        precision: Vec::with_capacity(last + 2),
        recall: Vec::with_capacity(last + 2),
        thresholds: Vec::with_capacity(last + 1),
    };
    for &(threshold, tp, fp) in points[..=last].iter().rev() {
        curve.thresholds.push(threshold);
        curve.precision.push(tp as f64 / (tp + fp) as f64);
        curve.recall.push(if total_positives > 0 {
            tp as f64 / total_positives as f64
        } else {
            0.0
        });
    }
    curve.precision.push(1.0);
    curve.recall.push(0.0);
    Ok(curve)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdChoice {
    pub threshold: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
}

/// The threshold maximizing `2PR / (P + R + 1e-10)`. Ties resolve to the
/// lowest threshold.
pub fn optimal_f1_threshold(
    labels: ArrayView1<f64>,
    scores: ArrayView1<f64>,
) -> Result<(ThresholdChoice, PrecisionRecallCurve), ThresholdError> {
    let curve = precision_recall_curve(labels, scores)?;
    let mut best: Option<ThresholdChoice> = None;
    for (k, &threshold) in curve.thresholds.iter().enumerate() {
        let (p, r) = (curve.precision[k], curve.recall[k]);
        let f1 = 2.0 * p * r / (p + r + F1_EPSILON);
        if best.is_none_or(|b| f1 > b.f1) {
            best = Some(ThresholdChoice {
                threshold,
                f1,
                precision: p,
                recall: r,
            });
        }
    }
    // The curve always holds at least one threshold for non-empty input.
    let choice = best.ok_or(ThresholdError::EmptyInput)?;
    Ok((choice, curve))
}

/// Precision and recall of `scores` cut at a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperatingPoint {
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
}

pub fn operating_points(
    labels: ArrayView1<f64>,
    scores: ArrayView1<f64>,
    thresholds: &[f64],
) -> Vec<OperatingPoint> {
    thresholds
        .iter()
        .map(|&threshold| {
            let predicted: Vec<bool> = scores.iter().map(|&s| s >= threshold).collect();
            let counts = ConfusionCounts::tally(labels, &predicted);
            OperatingPoint {
                threshold,
                precision: counts.precision(),
                recall: counts.recall(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn curve_matches_hand_computation() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        let s = array![0.1, 0.4, 0.35, 0.8];
        let curve = precision_recall_curve(y.view(), s.view()).unwrap();
        assert_eq!(curve.thresholds, vec![0.35, 0.4, 0.8]);
        assert_eq!(curve.recall, vec![1.0, 0.5, 0.5, 0.0]);
        assert_abs_diff_eq!(curve.precision[0], 2.0 / 3.0);
        assert_abs_diff_eq!(curve.precision[1], 0.5);
        assert_abs_diff_eq!(curve.precision[2], 1.0);
        assert_eq!(curve.precision[3], 1.0);
    }

    #[test]
    fn picks_the_best_f1_threshold() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        let s = array![0.1, 0.4, 0.35, 0.8];
        let (choice, _) = optimal_f1_threshold(y.view(), s.view()).unwrap();
        // F1 at 0.35 is 0.8, at 0.4 is 0.5, at 0.8 is 2/3.
        assert_eq!(choice.threshold, 0.35);
        assert_abs_diff_eq!(choice.f1, 0.8, epsilon = 1e-9);
    }

    #[test]
    fn threshold_lies_in_score_range_and_maximizes_f1() {
        let y = Array1::from_iter((0..50).map(|i| if i % 4 == 0 { 1.0 } else { 0.0 }));
        let s = Array1::from_iter((0..50).map(|i| ((i * 37) % 50) as f64 / 50.0));
        let (choice, curve) = optimal_f1_threshold(y.view(), s.view()).unwrap();
        let min = s.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = s.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(choice.threshold >= min && choice.threshold <= max);
        for k in 0..curve.thresholds.len() {
            let (p, r) = (curve.precision[k], curve.recall[k]);
            assert!(2.0 * p * r / (p + r + F1_EPSILON) <= choice.f1 + 1e-12);
        }
    }

    #[test]
    fn single_class_inputs_still_yield_a_threshold() {
        let s = array![0.2, 0.7, 0.5];
        let (all_pos, _) = optimal_f1_threshold(array![1.0, 1.0, 1.0].view(), s.view()).unwrap();
        assert_eq!(all_pos.threshold, 0.2);
        let (all_neg, _) = optimal_f1_threshold(array![0.0, 0.0, 0.0].view(), s.view()).unwrap();
        assert_eq!(all_neg.threshold, 0.7);
        assert_eq!(all_neg.f1, 0.0);
    }

    #[test]
    fn empty_input_is_an_error() {
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(
            optimal_f1_threshold(empty.view(), empty.view()).unwrap_err(),
            ThresholdError::EmptyInput
        );
    }

    #[test]
    fn operating_points_use_inclusive_cutoffs() {
        let y = array![1.0, 0.0, 1.0];
        let s = array![0.5, 0.5, 0.1];
        let points = operating_points(y.view(), s.view(), &[0.5]);
        assert_abs_diff_eq!(points[0].precision, 0.5);
        assert_abs_diff_eq!(points[0].recall, 0.5);
    }
}
