//! # Member-Level Splitting
//!
//! Partitions are assigned per member, never per row, so every period of a
//! member lands in the same partition. Member ids are sorted before shuffling,
//! which makes the assignment depend only on the set of members and the seed.

use crate::data::MemberTable;
use ahash::AHashMap;
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Target column '{0}' was not found in the member-period table.")]
    TargetNotFound(String),
    #[error("Target column '{0}' is not numeric.")]
    TargetNotNumeric(String),
}

/// One of the three disjoint partitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Validation,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Validation, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validation => "validation",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of all members held out for testing.
    pub test_fraction: f64,
    /// Fraction of the remaining members held out for validation.
    pub validation_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            validation_fraction: 0.25,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataSplits {
    pub train: MemberTable,
    pub validation: MemberTable,
    pub test: MemberTable,
    /// Partition of every member present in the input, including members whose
    /// rows were all dropped for a null target.
    pub assignment: AHashMap<String, Partition>,
}

impl DataSplits {
    pub fn partition(&self, partition: Partition) -> &MemberTable {
        match partition {
            Partition::Train => &self.train,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }
}

/// Splits `table` into train/validation/test by member and drops rows whose
/// target is null. An empty table yields three empty partitions.
pub fn split_by_member(
    table: &MemberTable,
    target: &str,
    config: &SplitConfig,
) -> Result<DataSplits, SplitError> {
    if table.is_empty() {
        info!("Member-period table is empty; all partitions are empty.");
        return Ok(DataSplits::default());
    }
    let labels = match table.column(target) {
        None => return Err(SplitError::TargetNotFound(target.to_string())),
        Some(_) => table
            .numeric(target)
            .ok_or_else(|| SplitError::TargetNotNumeric(target.to_string()))?,
    };

    let mut members: Vec<&str> = table.member_ids().iter().map(String::as_str).collect();
    members.sort_unstable();
    members.dedup();

    let (remaining, test_members) = internal::hold_out(members, config.test_fraction, config.seed);
    let (train_members, validation_members) =
        internal::hold_out(remaining, config.validation_fraction, config.seed);

    let mut assignment = AHashMap::with_capacity(table.len());
    for (members, partition) in [
        (&train_members, Partition::Train),
        (&validation_members, Partition::Validation),
        (&test_members, Partition::Test),
    ] {
        for &member in members.iter() {
            assignment.insert(member.to_string(), partition);
        }
    }

    let mut rows: [Vec<usize>; 3] = Default::default();
    for (row, member) in table.member_ids().iter().enumerate() {
        if labels[row].is_nan() {
            continue;
        }
        if let Some(partition) = assignment.get(member) {
            rows[*partition as usize].push(row);
        }
    }
    let [train_rows, validation_rows, test_rows] = rows;

    let splits = DataSplits {
        train: table.select_rows(&train_rows),
        validation: table.select_rows(&validation_rows),
        test: table.select_rows(&test_rows),
        assignment,
    };

    for partition in Partition::ALL {
        let part = splits.partition(partition);
        let positives = part
            .numeric(target)
            .map(|y| y.iter().filter(|&&v| v > 0.5).count())
            .unwrap_or(0);
        let members = match partition {
            Partition::Train => train_members.len(),
            Partition::Validation => validation_members.len(),
            Partition::Test => test_members.len(),
        };
        info!(
            "{partition}: {members} members, {} rows, {} positive / {} negative for '{target}'.",
            part.len(),
            positives,
            part.len() - positives
        );
    }

    Ok(splits)
}

mod internal {
    use super::*;

    /// Shuffles `members` with a seeded generator and returns
    /// (kept, held_out), holding out `ceil(fraction * n)` members.
    pub(super) fn hold_out<'a>(
        mut members: Vec<&'a str>,
        fraction: f64,
        seed: u64,
    ) -> (Vec<&'a str>, Vec<&'a str>) {
        let mut rng = StdRng::seed_from_u64(seed);
        members.shuffle(&mut rng);
        let held = ((fraction * members.len() as f64).ceil() as usize).min(members.len());
        let kept = members.split_off(held);
        (kept, members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ColumnData;
    use crate::test_fixtures::{TARGET, member_table};
    use ahash::AHashSet;
    use ndarray::Array1;

    fn members_of(table: &MemberTable) -> AHashSet<String> {
        table.member_ids().iter().cloned().collect()
    }

    #[test]
    fn member_sets_are_disjoint_and_complete() {
        let table = member_table(200, 4, 3);
        let splits = split_by_member(&table, TARGET, &SplitConfig::default()).unwrap();

        let train = members_of(&splits.train);
        let validation = members_of(&splits.validation);
        let test = members_of(&splits.test);
        assert!(train.is_disjoint(&validation));
        assert!(train.is_disjoint(&test));
        assert!(validation.is_disjoint(&test));
        assert_eq!(train.len() + validation.len() + test.len(), 200);
        assert_eq!(test.len(), 40);
        assert_eq!(validation.len(), 40);
        assert_eq!(splits.train.len() + splits.validation.len() + splits.test.len(), 800);
    }

    #[test]
    fn split_is_deterministic_for_a_seed() {
        let table = member_table(120, 2, 9);
        let config = SplitConfig::default();
        let a = split_by_member(&table, TARGET, &config).unwrap();
        let b = split_by_member(&table, TARGET, &config).unwrap();
        assert_eq!(a.test.member_ids(), b.test.member_ids());
        assert_eq!(a.validation.member_ids(), b.validation.member_ids());

        let other = split_by_member(
            &table,
            TARGET,
            &SplitConfig {
                seed: 7,
                ..config
            },
        )
        .unwrap();
        assert_ne!(members_of(&a.test), members_of(&other.test));
    }

    #[test]
    fn null_targets_are_dropped_per_partition() {
        let ids: Vec<String> = (0..10).map(|i| format!("m{}", i / 2)).collect();
        let target: Vec<f64> = (0..10)
            .map(|i| if i % 2 == 0 { f64::NAN } else { (i % 4 == 1) as u8 as f64 })
            .collect();
        let table = MemberTable::new(
            ids,
            vec![None; 10],
            vec![("y".into(), ColumnData::Numeric(Array1::from_vec(target)))],
        )
        .unwrap();
        let splits = split_by_member(&table, "y", &SplitConfig::default()).unwrap();
        assert_eq!(splits.train.len() + splits.validation.len() + splits.test.len(), 5);
        for part in [&splits.train, &splits.validation, &splits.test] {
            assert!(part.numeric("y").unwrap().iter().all(|v| !v.is_nan()));
        }
        assert_eq!(splits.assignment.len(), 5);
    }

    #[test]
    fn all_null_target_gives_empty_partitions() {
        let table = MemberTable::new(
            vec!["a".into(), "b".into()],
            vec![None, None],
            vec![(
                "y".into(),
                ColumnData::Numeric(Array1::from_vec(vec![f64::NAN, f64::NAN])),
            )],
        )
        .unwrap();
        let splits = split_by_member(&table, "y", &SplitConfig::default()).unwrap();
        assert!(splits.train.is_empty());
        assert!(splits.validation.is_empty());
        assert!(splits.test.is_empty());
    }

    #[test]
    fn empty_table_is_not_an_error() {
        let splits =
            split_by_member(&MemberTable::default(), "y", &SplitConfig::default()).unwrap();
        assert!(splits.train.is_empty() && splits.test.is_empty());
    }

    #[test]
    fn missing_target_is_an_error() {
        let table = member_table(5, 1, 1);
        assert!(matches!(
            split_by_member(&table, "nope", &SplitConfig::default()),
            Err(SplitError::TargetNotFound(_))
        ));
        assert!(matches!(
            split_by_member(&table, "plan", &SplitConfig::default()),
            Err(SplitError::TargetNotNumeric(_))
        ));
    }
}
