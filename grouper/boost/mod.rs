//! # Gradient-Boosted Trees
//!
//! A second-order boosted ensemble of histogram regression trees on the logistic
//! loss, with the hyperparameter search used to configure it.

pub mod ensemble;
pub mod search;
pub mod tree;

pub use ensemble::{BoostParams, BoostedEnsemble, positive_class_weight};
pub use search::{SearchConfig, SearchOutcome, SearchSpace, SearchStrategy, train_boosted};
pub use tree::{RegressionTree, TreeNode};
