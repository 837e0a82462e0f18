//! # Feature Selection
//!
//! The feature set is derived once, from the training partition, and then used
//! to build design matrices for every partition in the same column order.

use crate::data::{ColumnData, MemberTable, normalize_name};
use ahash::AHashSet;
use itertools::Itertools;
use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Result of scanning a table for usable predictors.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSelection {
    /// Selected feature names, in table order.
    pub features: Vec<String>,
    /// Columns that would otherwise qualify but are not numeric.
    pub skipped_non_numeric: Vec<String>,
}

/// Selects the numeric predictors of `table`.
///
/// Excluded are the target, every outcome column (all horizons and event
/// types, not only the current target) and everything in `exclude`. Names are
/// compared after trimming and lower-casing.
pub fn select_features(
    table: &MemberTable,
    target: &str,
    exclude: &[String],
    outcome_columns: &[String],
) -> FeatureSelection {
    let excluded: AHashSet<String> = exclude
        .iter()
        .chain(outcome_columns)
        .map(|name| normalize_name(name))
        .chain(std::iter::once(normalize_name(target)))
        .collect();

    let mut features = Vec::new();
    let mut skipped_non_numeric = Vec::new();
    for name in table.column_names() {
        if excluded.contains(name) {
            continue;
        }
        match table.column(name) {
            Some(ColumnData::Numeric(_)) => features.push(name.clone()),
            _ => {
                warn!("Skipping non-numeric column '{name}'.");
                skipped_non_numeric.push(name.clone());
            }
        }
    }

    info!(
        "Selected {} features for '{}' ({} non-numeric columns skipped).",
        features.len(),
        normalize_name(target),
        skipped_non_numeric.len()
    );
    FeatureSelection {
        features,
        skipped_non_numeric,
    }
}

/// An ordered feature list fixed at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    names: Vec<String>,
    /// `true` where every non-null training value is exactly 0 or 1.
    binary: Vec<bool>,
}

impl FeatureSet {
    /// Fixes the feature order and detects binary flags from the training rows.
    pub fn from_training(train: &MemberTable, names: Vec<String>) -> Self {
        let binary = names
            .iter()
            .map(|name| {
                train.numeric(name).is_some_and(|values| {
                    let mut seen = false;
                    let all_flags = values.iter().filter(|v| !v.is_nan()).all(|&v| {
                        seen = true;
                        v == 0.0 || v == 1.0
                    });
                    seen && all_flags
                })
            })
            .collect::<Vec<_>>();
        let flags = names
            .iter()
            .zip(&binary)
            .filter(|(_, is_flag)| **is_flag)
            .map(|(name, _)| name.as_str())
            .join(", ");
        if !flags.is_empty() {
            info!("Binary indicator features: {flags}");
        }
        Self { names, binary }
    }

    /// A feature set in which no feature is treated as a binary flag.
    pub fn continuous(names: Vec<String>) -> Self {
        let binary = vec![false; names.len()];
        Self { names, binary }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_binary(&self, index: usize) -> bool {
        self.binary.get(index).copied().unwrap_or(false)
    }

    /// Builds the design matrix of `table` in training order. Columns the table
    /// lacks, or holds as text, are zero-filled; null cells stay `NaN`.
    pub fn design_matrix(&self, table: &MemberTable) -> Array2<f64> {
        let mut matrix = Array2::zeros((table.len(), self.names.len()));
        let mut filled = Vec::new();
        for (j, name) in self.names.iter().enumerate() {
            match table.numeric(name) {
                Some(values) => matrix.column_mut(j).assign(values),
                None => filled.push(name.as_str()),
            }
        }
        if !filled.is_empty() && !table.is_empty() {
            warn!(
                "{} feature column(s) absent from this partition were zero-filled: {}",
                filled.len(),
                filled.iter().join(", ")
            );
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{TARGET, member_table};
    use ndarray::Array1;

    fn outcomes() -> Vec<String> {
        ["ANY_EVENT_NEXT_90D", "ED_EVENT_NEXT_30D", "IP_EVENT_NEXT_60D"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn excludes_outcomes_target_and_exclusion_list() {
        let table = member_table(10, 1, 1);
        let selection = select_features(
            &table,
            " Any_Event_Next_90D ",
            &[" NOISE ".to_string()],
            &outcomes(),
        );
        assert_eq!(
            selection.features,
            vec!["age", "chronic_count", "recent_er_flag"]
        );
        assert_eq!(selection.skipped_non_numeric, vec!["plan"]);
    }

    #[test]
    fn other_horizons_never_leak_into_features() {
        let table = member_table(10, 1, 2);
        let siblings = vec![TARGET.to_string(), "ED_Event_Next_30d".to_string()];
        let selection = select_features(&table, TARGET, &[], &siblings);
        assert!(!selection.features.iter().any(|f| f == TARGET));
        assert!(!selection.features.iter().any(|f| f == "ed_event_next_30d"));

        let guarded = select_features(&table, TARGET, &[], &outcomes());
        assert!(!guarded.features.iter().any(|f| f.contains("_event_next_")));
    }

    #[test]
    fn design_matrix_reindexes_and_zero_fills() {
        let train = member_table(20, 1, 4);
        let set = FeatureSet::from_training(
            &train,
            vec!["age".into(), "recent_er_flag".into(), "missing_col".into(), "plan".into()],
        );
        assert!(set.is_binary(1));
        assert!(!set.is_binary(0));
        assert!(!set.is_binary(2));

        let other = MemberTable::new(
            vec!["x".into(), "y".into()],
            vec![None, None],
            vec![
                (
                    "recent_er_flag".into(),
                    ColumnData::Numeric(Array1::from_vec(vec![1.0, f64::NAN])),
                ),
                ("age".into(), ColumnData::Numeric(Array1::from_vec(vec![40.0, 41.0]))),
            ],
        )
        .unwrap();
        let matrix = set.design_matrix(&other);
        assert_eq!(matrix.dim(), (2, 4));
        assert_eq!(matrix[[0, 0]], 40.0);
        assert_eq!(matrix[[0, 1]], 1.0);
        assert!(matrix[[1, 1]].is_nan());
        assert_eq!(matrix[[0, 2]], 0.0);
        assert_eq!(matrix[[1, 3]], 0.0);
    }

    #[test]
    fn all_null_column_is_not_binary() {
        let table = MemberTable::new(
            vec!["a".into()],
            vec![None],
            vec![("z".into(), ColumnData::Numeric(Array1::from_vec(vec![f64::NAN])))],
        )
        .unwrap();
        let set = FeatureSet::from_training(&table, vec!["z".into()]);
        assert!(!set.is_binary(0));
    }
}
