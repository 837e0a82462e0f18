//! Histogram-based regression trees fitted to second-order gradient statistics.
//!
//! Feature values are bucketed once per ensemble into quantile bins. Bin 0 holds
//! nulls; bins `1..=m+1` hold values between consecutive cut points. A split
//! after bin `j` sends values strictly below cut `j` to the left child, and every
//! split learns which side nulls default to.

use ndarray::ArrayView1;
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Below this many rows a node scans its features sequentially.
const PARALLEL_SCAN_ROWS: usize = 4096;
/// Splits must improve the regularized objective by at least this much.
const MIN_SPLIT_IMPROVEMENT: f64 = 1e-6;

/// Cut points per feature, fitted on the training matrix.
#[derive(Debug, Clone)]
pub struct FeatureBinner {
    cuts: Vec<Vec<f64>>,
}

/// Column-major bin indices.
#[derive(Debug, Clone)]
pub struct BinnedMatrix {
    columns: Vec<Vec<u16>>,
}

impl FeatureBinner {
    pub fn fit(x: ArrayView2<f64>, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, u16::MAX as usize - 2);
        let cuts = x
            .columns()
            .into_iter()
            .map(|column| cut_points(column, max_bins))
            .collect();
        Self { cuts }
    }

    /// Number of bins of `feature`, including the null bin.
    pub fn n_bins(&self, feature: usize) -> usize {
        self.cuts[feature].len() + 2
    }

    pub fn cuts(&self, feature: usize) -> &[f64] {
        &self.cuts[feature]
    }

    /// The raw-value threshold equivalent to splitting after bin `bin`.
    pub fn threshold(&self, feature: usize, bin: usize) -> f64 {
        self.cuts[feature][bin - 1]
    }

    pub fn bin_value(&self, feature: usize, value: f64) -> u16 {
        if value.is_nan() {
            0
        } else {
            (1 + self.cuts[feature].partition_point(|&c| c <= value)) as u16
        }
    }

    pub fn bin_matrix(&self, x: ArrayView2<f64>) -> BinnedMatrix {
        let columns = x
            .columns()
            .into_iter()
            .enumerate()
            .map(|(f, column)| column.iter().map(|&v| self.bin_value(f, v)).collect())
            .collect();
        BinnedMatrix { columns }
    }
}

impl BinnedMatrix {
    pub fn column(&self, feature: usize) -> &[u16] {
        &self.columns[feature]
    }
}

/// Midpoints between distinct values, thinned to quantiles when a column has more
/// distinct values than bins.
fn cut_points(column: ArrayView1<f64>, max_bins: usize) -> Vec<f64> {
    let mut values: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    values.sort_by(f64::total_cmp);
    let mut unique = values.clone();
    unique.dedup();
    if unique.len() < 2 {
        return Vec::new();
    }
    if unique.len() <= max_bins {
        return unique.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    }
    let mut cuts = Vec::with_capacity(max_bins);
    for q in 1..max_bins {
        let v = values[q * values.len() / max_bins];
        let pos = unique.partition_point(|&u| u < v);
        if pos > 0 {
            cuts.push(0.5 * (unique[pos - 1] + unique[pos]));
        }
    }
    cuts.dedup();
    cuts
}

/// A node of a fitted tree. Leaves ignore the split fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub is_leaf: bool,
    pub feature: usize,
    pub threshold: f64,
    /// Whether null values follow the left child.
    pub default_left: bool,
    pub left: usize,
    pub right: usize,
    /// Leaf output on the margin scale, learning rate already applied.
    pub value: f64,
    /// Sum of hessians of the training rows that reached this node.
    pub cover: f64,
    /// Loss reduction of the split; zero for leaves.
    pub gain: f64,
}

impl TreeNode {
    fn leaf(value: f64, cover: f64) -> Self {
        Self {
            is_leaf: true,
            feature: 0,
            threshold: 0.0,
            default_left: true,
            left: 0,
            right: 0,
            value,
            cover,
            gain: 0.0,
        }
    }

    /// The child a row with `value` for this node's feature descends into.
    #[inline]
    pub fn child_for(&self, value: f64) -> usize {
        if value.is_nan() {
            if self.default_left { self.left } else { self.right }
        } else if value < self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// A fitted regression tree; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn leaf_index(&self, row: ArrayView1<f64>) -> usize {
        let mut index = 0;
        loop {
            let node = &self.nodes[index];
            if node.is_leaf {
                return index;
            }
            index = node.child_for(row[node.feature]);
        }
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.nodes[self.leaf_index(row)].value
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], index: usize) -> usize {
            let node = &nodes[index];
            if node.is_leaf {
                0
            } else {
                1 + walk(nodes, node.left).max(walk(nodes, node.right))
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Regularization and shape limits for a single tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_split_loss: f64,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
    pub min_child_weight: f64,
}

impl TreeParams {
    /// L1 soft-thresholding of a gradient sum.
    #[inline]
    fn shrink(&self, g: f64) -> f64 {
        if g > self.reg_alpha {
            g - self.reg_alpha
        } else if g < -self.reg_alpha {
            g + self.reg_alpha
        } else {
            0.0
        }
    }

    #[inline]
    fn score(&self, g: f64, h: f64) -> f64 {
        let t = self.shrink(g);
        t * t / (h + self.reg_lambda)
    }

    #[inline]
    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        let denom = h + self.reg_lambda;
        if denom <= 0.0 {
            return 0.0;
        }
        -self.learning_rate * self.shrink(g) / denom
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    default_left: bool,
    gain: f64,
}

/// Grows one tree over a subset of rows and features.
pub struct TreeGrower<'a> {
    binner: &'a FeatureBinner,
    binned: &'a BinnedMatrix,
    gradients: &'a [f64],
    hessians: &'a [f64],
    features: &'a [usize],
    params: TreeParams,
    nodes: Vec<TreeNode>,
}

impl<'a> TreeGrower<'a> {
    pub fn new(
        binner: &'a FeatureBinner,
        binned: &'a BinnedMatrix,
        gradients: &'a [f64],
        hessians: &'a [f64],
        features: &'a [usize],
        params: TreeParams,
    ) -> Self {
        Self {
            binner,
            binned,
            gradients,
            hessians,
            features,
            params,
            nodes: Vec::new(),
        }
    }

    pub fn grow(mut self, rows: Vec<usize>) -> RegressionTree {
        self.build(rows, 0);
        RegressionTree { nodes: self.nodes }
    }

    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|&r| self.gradients[r]).sum();
        let h: f64 = rows.iter().map(|&r| self.hessians[r]).sum();
        let index = self.nodes.len();
        self.nodes
            .push(TreeNode::leaf(self.params.leaf_value(g, h), h));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return index;
        }
        let Some(split) = self.best_split(&rows, g, h) else {
            return index;
        };

        let column = self.binned.column(split.feature);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| {
                let bin = column[r] as usize;
                if bin == 0 {
                    split.default_left
                } else {
                    bin <= split.bin
                }
            });

        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        self.nodes[index] = TreeNode {
            is_leaf: false,
            feature: split.feature,
            threshold: self.binner.threshold(split.feature, split.bin),
            default_left: split.default_left,
            left,
            right,
            value: 0.0,
            cover: h,
            gain: split.gain,
        };
        index
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = self.params.score(g, h);
        let scanned: Vec<Option<SplitCandidate>> = if rows.len() >= PARALLEL_SCAN_ROWS {
            self.features
                .par_iter()
                .map(|&f| self.scan_feature(f, rows, g, h, parent))
                .collect()
        } else {
            self.features
                .iter()
                .map(|&f| self.scan_feature(f, rows, g, h, parent))
                .collect()
        };
        scanned
            .into_iter()
            .flatten()
            .fold(None, |best: Option<SplitCandidate>, c| match best {
                Some(b) if b.gain >= c.gain => Some(b),
                _ => Some(c),
            })
    }

    fn scan_feature(
        &self,
        feature: usize,
        rows: &[usize],
        g: f64,
        h: f64,
        parent: f64,
    ) -> Option<SplitCandidate> {
        let bins = self.binner.n_bins(feature);
        if bins <= 2 {
            return None;
        }
        let column = self.binned.column(feature);
        let mut hist_g = vec![0.0; bins];
        let mut hist_h = vec![0.0; bins];
        for &r in rows {
            let b = column[r] as usize;
            hist_g[b] += self.gradients[r];
            hist_h[b] += self.hessians[r];
        }
        let (missing_g, missing_h) = (hist_g[0], hist_h[0]);

        let mut best: Option<SplitCandidate> = None;
        let (mut gl, mut hl) = (0.0, 0.0);
        for bin in 1..bins - 1 {
            gl += hist_g[bin];
            hl += hist_h[bin];
            for default_left in [true, false] {
                let (lg, lh) = if default_left {
                    (gl + missing_g, hl + missing_h)
                } else {
                    (gl, hl)
                };
                let (rg, rh) = (g - lg, h - lh);
                if lh < self.params.min_child_weight
                    || rh < self.params.min_child_weight
                    || lh <= 0.0
                    || rh <= 0.0
                {
                    continue;
                }
                let gain = self.params.score(lg, lh) + self.params.score(rg, rh) - parent;
                if gain <= self.params.min_split_loss || gain <= MIN_SPLIT_IMPROVEMENT {
                    continue;
                }
                if best.is_none_or(|b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        bin,
                        default_left,
                        gain,
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn params() -> TreeParams {
        TreeParams {
            max_depth: 3,
            learning_rate: 1.0,
            min_split_loss: 0.0,
            reg_alpha: 0.0,
            reg_lambda: 0.0,
            min_child_weight: 0.0,
        }
    }

    #[test]
    fn bins_respect_cut_points_and_nulls() {
        let x = array![[1.0], [2.0], [3.0], [f64::NAN]];
        let binner = FeatureBinner::fit(x.view(), 256);
        assert_eq!(binner.cuts(0), &[1.5, 2.5]);
        assert_eq!(binner.bin_value(0, f64::NAN), 0);
        assert_eq!(binner.bin_value(0, 1.0), 1);
        assert_eq!(binner.bin_value(0, 2.0), 2);
        assert_eq!(binner.bin_value(0, 100.0), 3);
        assert_eq!(binner.threshold(0, 1), 1.5);
    }

    #[test]
    fn quantile_cuts_are_bounded_and_increasing() {
        let x = Array2::from_shape_fn((1000, 1), |(i, _)| i as f64);
        let binner = FeatureBinner::fit(x.view(), 16);
        let cuts = binner.cuts(0);
        assert!(cuts.len() <= 15);
        assert!(cuts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tree_separates_a_step_function_and_routes_nulls() {
        // Squared-error gradients for targets 0/0/1/1 around a zero prediction,
        // with the null row behaving like the high group.
        let x = array![[0.0], [1.0], [2.0], [3.0], [f64::NAN]];
        let targets = [0.0, 0.0, 1.0, 1.0, 1.0];
        let gradients: Vec<f64> = targets.iter().map(|t| -t).collect();
        let hessians = vec![1.0; 5];
        let binner = FeatureBinner::fit(x.view(), 256);
        let binned = binner.bin_matrix(x.view());
        let features = [0];
        let tree = TreeGrower::new(&binner, &binned, &gradients, &hessians, &features, params())
            .grow((0..5).collect());

        for (row, target) in x.rows().into_iter().zip(targets) {
            assert!((tree.predict_row(row) - target).abs() < 1e-12);
        }
        let root = &tree.nodes()[0];
        assert!(!root.is_leaf);
        assert_eq!(root.threshold, 1.5);
        assert!(!root.default_left);
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn regularization_prevents_splits() {
        let x = array![[0.0], [1.0]];
        let gradients = [-1.0, 1.0];
        let hessians = [1.0, 1.0];
        let binner = FeatureBinner::fit(x.view(), 256);
        let binned = binner.bin_matrix(x.view());
        let heavy = TreeParams {
            min_split_loss: 10.0,
            ..params()
        };
        let tree = TreeGrower::new(&binner, &binned, &gradients, &hessians, &[0], heavy)
            .grow(vec![0, 1]);
        assert_eq!(tree.nodes().len(), 1);
        assert_eq!(tree.nodes()[0].value, 0.0);
    }
}
