//! # Classification Metrics
//!
//! Ranking metrics (ROC-AUC, average precision) are undefined when the labels
//! hold a single class and are reported as `None`. Thresholded metrics use a
//! zero-division value of 0.

use crate::model::ModelKind;
use crate::split::Partition;
use ndarray::ArrayView1;
use serde::{Serialize, Serializer};

/// ROC-AUC via the rank-sum statistic, with tied scores sharing their average
/// rank. `None` unless both classes are present.
pub fn roc_auc(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> Option<f64> {
    let n = labels.len();
    let positives = labels.iter().filter(|&&y| y == 1.0).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; the group spans ranks start+1..=end.
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let group_positives = order[start..end]
            .iter()
            .filter(|&&i| labels[i] == 1.0)
            .count();
        positive_rank_sum += average_rank * group_positives as f64;
        start = end;
    }

    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

/// Average precision: the precision-weighted mean of recall increments over
/// distinct score thresholds, taken in decreasing order.
pub fn average_precision(labels: ArrayView1<f64>, scores: ArrayView1<f64>) -> Option<f64> {
    let n = labels.len();
    let positives = labels.iter().filter(|&&y| y == 1.0).count();
    if positives == 0 || positives == n {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut ap = 0.0;
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut previous_recall = 0.0;
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
        let recall = tp as f64 / positives as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        ap += (recall - previous_recall) * precision;
        previous_recall = recall;
    }
    Some(ap)
}

/// `1 - ll_model / ll_null`, where the null model predicts the label mean.
/// `None` when the null log-likelihood is zero (a single class).
pub fn mcfadden_r2(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> Option<f64> {
    if labels.is_empty() {
        return None;
    }
    let mean = labels.mean()?;
    let ll = |y: f64, p: f64| {
        let p = p.clamp(1e-15, 1.0 - 1e-15);
        y * p.ln() + (1.0 - y) * (1.0 - p).ln()
    };
    let ll_model: f64 = labels
        .iter()
        .zip(probabilities.iter())
        .map(|(&y, &p)| ll(y, p))
        .sum();
    let ll_null: f64 = labels.iter().map(|&y| ll(y, mean)).sum();
    if ll_null.abs() < 1e-12 {
        return None;
    }
    let r2 = 1.0 - ll_model / ll_null;
    r2.is_finite().then_some(r2)
}

/// Pseudo-R² as reported per model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PseudoR2 {
    Value(f64),
    /// Could not be computed for this split.
    Undefined,
    /// The model family has no likelihood-based pseudo-R².
    NotApplicable,
}

impl Serialize for PseudoR2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PseudoR2::Value(v) => serializer.serialize_f64(*v),
            PseudoR2::Undefined => serializer.serialize_none(),
            PseudoR2::NotApplicable => serializer.serialize_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionCounts {
    pub fn tally(labels: ArrayView1<f64>, predicted: &[bool]) -> Self {
        let mut counts = ConfusionCounts::default();
        for (&y, &p) in labels.iter().zip(predicted) {
            match (y == 1.0, p) {
                (true, true) => counts.tp += 1,
                (false, true) => counts.fp += 1,
                (false, false) => counts.tn += 1,
                (true, false) => counts.fn_ += 1,
            }
        }
        counts
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.tp + self.tn + self.fp + self.fn_)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Metrics of one model on one partition.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationMetrics {
    pub target: String,
    pub model: ModelKind,
    pub split: Partition,
    pub rows: usize,
    pub positives: usize,
    pub roc_auc: Option<f64>,
    pub pr_auc: Option<f64>,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub confusion: ConfusionCounts,
    pub threshold_used: f64,
    pub pseudo_r2: PseudoR2,
}

/// Computes every metric for `probabilities` thresholded at `threshold`
/// (a row is predicted positive when its probability is at least the threshold).
pub fn compute_metrics(
    target: &str,
    model: ModelKind,
    split: Partition,
    labels: ArrayView1<f64>,
    probabilities: ArrayView1<f64>,
    threshold: f64,
) -> ClassificationMetrics {
    let predicted: Vec<bool> = probabilities.iter().map(|&p| p >= threshold).collect();
    let confusion = ConfusionCounts::tally(labels, &predicted);
    let pseudo_r2 = match model {
        ModelKind::Logistic => mcfadden_r2(labels, probabilities)
            .map_or(PseudoR2::Undefined, PseudoR2::Value),
        ModelKind::Boosted => PseudoR2::NotApplicable,
    };
    ClassificationMetrics {
        target: target.to_string(),
        model,
        split,
        rows: labels.len(),
        positives: confusion.tp + confusion.fn_,
        roc_auc: roc_auc(labels, probabilities),
        pr_auc: average_precision(labels, probabilities),
        f1: confusion.f1(),
        precision: confusion.precision(),
        recall: confusion.recall(),
        accuracy: confusion.accuracy(),
        confusion,
        threshold_used: threshold,
        pseudo_r2,
    }
}

/// One probability bin of a calibration table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    /// Sum of the binned probabilities.
    pub predicted_events: f64,
    pub actual_events: usize,
    pub mean_score: Option<f64>,
    /// `actual_events / predicted_events`; `None` when nothing was predicted.
    pub calibration_percent: Option<f64>,
}

/// `bins + 1` equally spaced edges spanning the finite values of every score
/// array, so several models can be binned on a common scale. Empty when no
/// finite score exists.
pub fn calibration_edges(scores: &[ArrayView1<f64>], bins: usize) -> Vec<f64> {
    let (low, high) = scores
        .iter()
        .flat_map(|s| s.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if bins == 0 || low > high {
        return Vec::new();
    }
    let width = (high - low) / bins as f64;
    (0..=bins)
        .map(|i| if i == bins { high } else { low + width * i as f64 })
        .collect()
}

/// Bins `probabilities` on `edges`. Bins are right-closed, and the first one
/// also includes its lower edge. Scores outside the edges, or not finite, are
/// left out.
pub fn calibration_bins(
    labels: ArrayView1<f64>,
    probabilities: ArrayView1<f64>,
    edges: &[f64],
) -> Vec<CalibrationBin> {
    if edges.len() < 2 {
        return Vec::new();
    }
    let bins = edges.len() - 1;
    let mut count = vec![0usize; bins];
    let mut predicted = vec![0.0; bins];
    let mut actual = vec![0usize; bins];
    let (first, last) = (edges[0], edges[bins]);
    for (&y, &p) in labels.iter().zip(probabilities.iter()) {
        if !p.is_finite() || p < first || p > last {
            continue;
        }
        let bin = edges.partition_point(|&e| e < p).saturating_sub(1).min(bins - 1);
        count[bin] += 1;
        predicted[bin] += p;
        actual[bin] += usize::from(y == 1.0);
    }
    (0..bins)
        .map(|b| CalibrationBin {
            lower: edges[b],
            upper: edges[b + 1],
            count: count[b],
            predicted_events: predicted[b],
            actual_events: actual[b],
            mean_score: (count[b] > 0).then(|| predicted[b] / count[b] as f64),
            calibration_percent: (predicted[b] > 0.0).then(|| actual[b] as f64 / predicted[b]),
        })
        .collect()
}
