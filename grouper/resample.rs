//! Synthetic minority oversampling (SMOTE) for the training partition.
//!
//! New minority rows are interpolated between a randomly chosen minority row and
//! one of its `k` nearest minority neighbours until both classes have the same
//! number of rows. Nulls are read as zero, both for the distance computation and
//! in the returned matrix.

use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("Oversampling needs at least two minority rows, found {0}.")]
    TooFewMinority(usize),
    #[error("Oversampling needs both classes present in the labels.")]
    SingleClass,
    #[error("The design matrix has {rows} rows, but {labels} labels were provided.")]
    DimensionMismatch { rows: usize, labels: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoteConfig {
    pub k_neighbors: usize,
    pub seed: u64,
}

impl Default for SmoteConfig {
    fn default() -> Self {
        Self {
            k_neighbors: 5,
            seed: 42,
        }
    }
}

/// Returns the original rows followed by the synthetic minority rows.
pub fn oversample_minority(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &SmoteConfig,
) -> Result<(Array2<f64>, Array1<f64>), ResampleError> {
    if x.nrows() != y.len() {
        return Err(ResampleError::DimensionMismatch {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    let positives: Vec<usize> = (0..y.len()).filter(|&i| y[i] > 0.5).collect();
    let negatives = y.len() - positives.len();
    if positives.is_empty() || negatives == 0 {
        return Err(ResampleError::SingleClass);
    }
    let (minority_label, minority): (f64, Vec<usize>) = if positives.len() <= negatives {
        (1.0, positives)
    } else {
        (0.0, (0..y.len()).filter(|&i| y[i] <= 0.5).collect())
    };
    let majority_count = y.len() - minority.len();
    if minority.len() < 2 {
        return Err(ResampleError::TooFewMinority(minority.len()));
    }

    let filled = x.mapv(|v| if v.is_nan() { 0.0 } else { v });
    let k = config.k_neighbors.clamp(1, minority.len() - 1);
    let neighbours: Vec<Vec<usize>> = minority
        .par_iter()
        .map(|&row| internal::nearest(filled.view(), &minority, row, k))
        .collect();

    let synthetic = majority_count - minority.len();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let features = x.ncols();
    let mut out_x = Array2::zeros((y.len() + synthetic, features));
    out_x.slice_mut(s![..y.len(), ..]).assign(&filled);
    let mut out_y = Array1::zeros(y.len() + synthetic);
    out_y.slice_mut(s![..y.len()]).assign(&y);

    for n in 0..synthetic {
        let pick = rng.gen_range(0..minority.len());
        let neighbour = neighbours[pick][rng.gen_range(0..neighbours[pick].len())];
        let gap: f64 = rng.gen_range(0.0..1.0);
        let base = filled.row(minority[pick]);
        let other = filled.row(neighbour);
        let mut target = out_x.row_mut(y.len() + n);
        for j in 0..features {
            target[j] = base[j] + gap * (other[j] - base[j]);
        }
        out_y[y.len() + n] = minority_label;
    }

    info!(
        "Oversampled the minority class ({}) from {} to {} rows.",
        minority_label,
        minority.len(),
        minority.len() + synthetic
    );
    debug_assert_eq!(out_x.len_of(Axis(0)), out_y.len());
    Ok((out_x, out_y))
}

mod internal {
    use super::*;

    /// Indices of the `k` minority rows closest to `row`, excluding itself.
    pub(super) fn nearest(
        x: ArrayView2<f64>,
        minority: &[usize],
        row: usize,
        k: usize,
    ) -> Vec<usize> {
        let origin = x.row(row);
        let mut distances: Vec<(f64, usize)> = minority
            .iter()
            .filter(|&&other| other != row)
            .map(|&other| {
                let d = origin
                    .iter()
                    .zip(x.row(other).iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>();
                (d, other)
            })
            .collect();
        distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        distances.truncate(k);
        distances.into_iter().map(|(_, i)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::labelled_matrix;
    use ndarray::array;

    #[test]
    fn balances_classes_and_keeps_originals() {
        let (x, y) = labelled_matrix(300, 11);
        let positives = y.iter().filter(|&&v| v > 0.5).count();
        let negatives = y.len() - positives;
        assert!(positives < negatives);

        let (rx, ry) = oversample_minority(x.view(), y.view(), &SmoteConfig::default()).unwrap();
        let new_pos = ry.iter().filter(|&&v| v > 0.5).count();
        assert_eq!(new_pos, negatives);
        assert_eq!(rx.nrows(), 2 * negatives);
        assert_eq!(rx.slice(s![..300, ..]), x);
    }

    #[test]
    fn synthetic_rows_lie_between_minority_rows() {
        let x = array![[0.0, 0.0], [1.0, 1.0], [10.0, 10.0], [10.0, 11.0], [11.0, 10.0]];
        let y = array![1.0, 1.0, 0.0, 0.0, 0.0];
        let (rx, ry) = oversample_minority(x.view(), y.view(), &SmoteConfig::default()).unwrap();
        assert_eq!(rx.nrows(), 6);
        assert_eq!(ry[5], 1.0);
        let synthetic = rx.row(5);
        assert!((0.0..=1.0).contains(&synthetic[0]));
        assert_eq!(synthetic[0], synthetic[1]);
    }

    #[test]
    fn is_deterministic_for_a_seed() {
        let (x, y) = labelled_matrix(120, 5);
        let config = SmoteConfig::default();
        let a = oversample_minority(x.view(), y.view(), &config).unwrap();
        let b = oversample_minority(x.view(), y.view(), &config).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let x = array![[0.0], [1.0], [2.0]];
        assert!(matches!(
            oversample_minority(x.view(), array![0.0, 0.0, 0.0].view(), &SmoteConfig::default()),
            Err(ResampleError::SingleClass)
        ));
        assert!(matches!(
            oversample_minority(x.view(), array![1.0, 0.0, 0.0].view(), &SmoteConfig::default()),
            Err(ResampleError::TooFewMinority(1))
        ));
    }
}
