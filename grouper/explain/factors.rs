//! Turning raw attributions into the factor lists shown to care managers.

use super::RowAttribution;
use crate::features::FeatureSet;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Reporting limits shared by local and global factor extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorOptions {
    /// Continuous features with `|contribution|` at or below this are dropped.
    pub epsilon: f64,
    pub top_n: usize,
}

impl Default for FactorOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            top_n: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub feature: String,
    pub contribution: f64,
}

/// The explanation attached to one model's prediction for one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalExplanation {
    /// `None` for rows that could not be attributed.
    pub base_value: Option<f64>,
    /// Positive contributions, largest first.
    pub increasing: Vec<Factor>,
    /// Negative contributions, most negative first.
    pub decreasing: Vec<Factor>,
    pub reconstruction_error: Option<f64>,
}

impl LocalExplanation {
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.base_value.is_none()
    }
}

/// Splits a row's attribution into increasing and decreasing factors.
///
/// A binary flag is reported only when its value is 1. Any other feature is
/// reported when its contribution exceeds `epsilon` in magnitude.
pub fn local_factors(
    attribution: Option<&RowAttribution>,
    row: ArrayView1<f64>,
    features: &FeatureSet,
    options: &FactorOptions,
) -> LocalExplanation {
    let Some(attribution) = attribution else {
        return LocalExplanation::placeholder();
    };

    let mut increasing = Vec::new();
    let mut decreasing = Vec::new();
    for (j, (name, &c)) in features
        .names()
        .iter()
        .zip(&attribution.contributions)
        .enumerate()
    {
        let reportable = if features.is_binary(j) {
            row[j] == 1.0 && c != 0.0
        } else {
            c.abs() > options.epsilon
        };
        if !reportable {
            continue;
        }
        let factor = Factor {
            feature: name.clone(),
            contribution: c,
        };
        if c > 0.0 {
            increasing.push(factor);
        } else {
            decreasing.push(factor);
        }
    }
    increasing.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));
    decreasing.sort_by(|a, b| a.contribution.total_cmp(&b.contribution));
    increasing.truncate(options.top_n);
    decreasing.truncate(options.top_n);

    LocalExplanation {
        base_value: Some(attribution.base_value),
        increasing,
        decreasing,
        reconstruction_error: Some(attribution.reconstruction_error),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFactor {
    pub feature: String,
    pub mean_abs_contribution: f64,
    /// 1 for the most influential feature.
    pub rank: usize,
}

/// Mean absolute contribution per feature over the attributed rows of a slice,
/// ranked in decreasing order. Placeholder rows are skipped.
pub fn global_factors(
    attributions: &[Option<RowAttribution>],
    feature_names: &[String],
    options: &FactorOptions,
) -> Vec<GlobalFactor> {
    let mut sums = vec![0.0; feature_names.len()];
    let mut rows = 0usize;
    for attribution in attributions.iter().flatten() {
        rows += 1;
        for (s, c) in sums.iter_mut().zip(&attribution.contributions) {
            *s += c.abs();
        }
    }
    if rows == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<(usize, f64)> = sums
        .into_iter()
        .map(|s| s / rows as f64)
        .enumerate()
        .filter(|&(_, mean)| mean > options.epsilon)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(options.top_n)
        .enumerate()
        .map(|(position, (j, mean))| GlobalFactor {
            feature: feature_names[j].clone(),
            mean_abs_contribution: mean,
            rank: position + 1,
        })
        .collect()
}

/// How well contributions reconstruct predictions over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReconstructionSummary {
    pub rows: usize,
    pub attributed: usize,
    pub within_tolerance: usize,
    pub tolerance: f64,
    pub max_error: f64,
    pub mean_error: f64,
}

impl ReconstructionSummary {
    pub fn from_attributions(attributions: &[Option<RowAttribution>], tolerance: f64) -> Self {
        let errors: Vec<f64> = attributions
            .iter()
            .flatten()
            .map(|a| a.reconstruction_error)
            .collect();
        let attributed = errors.len();
        Self {
            rows: attributions.len(),
            attributed,
            within_tolerance: errors.iter().filter(|&&e| e <= tolerance).count(),
            tolerance,
            max_error: errors.iter().copied().fold(0.0, f64::max),
            mean_error: if attributed == 0 {
                0.0
            } else {
                errors.iter().sum::<f64>() / attributed as f64
            },
        }
    }

    /// Share of attributed rows within tolerance; 1 when nothing was attributed.
    pub fn fraction_within(&self) -> f64 {
        if self.attributed == 0 {
            1.0
        } else {
            self.within_tolerance as f64 / self.attributed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn attribution(contributions: Vec<f64>) -> RowAttribution {
        let total: f64 = contributions.iter().sum();
        RowAttribution {
            base_value: 0.2,
            predicted: 0.2 + total,
            contributions,
            reconstruction_error: 0.0,
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    #[test]
    fn factors_are_split_by_sign_and_sorted() {
        let features = FeatureSet::continuous(names(5));
        let a = attribution(vec![0.05, -0.2, 0.3, 1e-9, -0.01]);
        let row = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let local = local_factors(Some(&a), row.view(), &features, &FactorOptions::default());
        let inc: Vec<&str> = local.increasing.iter().map(|f| f.feature.as_str()).collect();
        let dec: Vec<&str> = local.decreasing.iter().map(|f| f.feature.as_str()).collect();
        assert_eq!(inc, vec!["f2", "f0"]);
        assert_eq!(dec, vec!["f1", "f4"]);
        assert_eq!(local.base_value, Some(0.2));
    }

    #[test]
    fn inactive_binary_flags_are_not_reported() {
        let table = crate::test_fixtures::member_table(30, 1, 1);
        let features =
            FeatureSet::from_training(&table, vec!["age".into(), "recent_er_flag".into()]);
        assert!(features.is_binary(1));
        let a = attribution(vec![0.1, -0.05]);
        let options = FactorOptions::default();
        let off = local_factors(Some(&a), array![40.0, 0.0].view(), &features, &options);
        assert!(off.decreasing.is_empty());
        let on = local_factors(Some(&a), array![40.0, 1.0].view(), &features, &options);
        assert_eq!(on.decreasing[0].feature, "recent_er_flag");
    }

    #[test]
    fn lists_are_truncated_to_top_n() {
        let features = FeatureSet::continuous(names(6));
        let a = attribution(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        let options = FactorOptions {
            epsilon: 1e-6,
            top_n: 2,
        };
        let local = local_factors(Some(&a), array![0.0, 0.0, 0.0, 0.0, 0.0, 0.0].view(), &features, &options);
        assert_eq!(local.increasing.len(), 2);
        assert_eq!(local.increasing[0].feature, "f5");
    }

    #[test]
    fn missing_attribution_yields_placeholder() {
        let features = FeatureSet::continuous(names(2));
        let local = local_factors(None, array![0.0, 0.0].view(), &features, &FactorOptions::default());
        assert!(local.is_placeholder());
        assert!(local.increasing.is_empty() && local.decreasing.is_empty());
        assert_eq!(local.reconstruction_error, None);
    }

    #[test]
    fn global_ranking_uses_mean_absolute_contribution() {
        let rows = vec![
            Some(attribution(vec![0.1, -0.4, 0.0])),
            None,
            Some(attribution(vec![-0.3, 0.2, 0.0])),
        ];
        let global = global_factors(&rows, &names(3), &FactorOptions::default());
        assert_eq!(global.len(), 2);
        assert_eq!(global[0].feature, "f1");
        assert_eq!(global[0].rank, 1);
        assert!((global[0].mean_abs_contribution - 0.3).abs() < 1e-12);
        assert_eq!(global[1].feature, "f0");
        assert_eq!(global[1].rank, 2);
    }

    #[test]
    fn reconstruction_summary_counts_rows_within_tolerance() {
        let mut bad = attribution(vec![0.1]);
        bad.reconstruction_error = 0.01;
        let rows = vec![Some(attribution(vec![0.1])), Some(bad), None];
        let summary = ReconstructionSummary::from_attributions(&rows, 1e-3);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.attributed, 2);
        assert_eq!(summary.within_tolerance, 1);
        assert_eq!(summary.fraction_within(), 0.5);
    }
}
