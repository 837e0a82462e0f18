//! # riskgrouper
//!
//! Adverse-event risk prediction for care-management members. A member-period
//! table is split by member, two classifiers are trained (a regularized logistic
//! model and a gradient-boosted tree ensemble), operating thresholds are chosen on
//! the validation partition, predictions are explained with SHAP-style
//! attributions, and the two models are combined into a single risk tier per
//! member for triage.

#![deny(unused_variables)]

pub mod boost;
pub mod config;
pub mod consensus;
pub mod data;
pub mod explain;
pub mod features;
pub mod linear;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod resample;
pub mod split;
pub mod threshold;

#[cfg(test)]
pub(crate) mod test_fixtures;

/// Logistic sigmoid. The margin is clamped so the exponential cannot overflow.
#[inline]
pub fn sigmoid(margin: f64) -> f64 {
    let m = margin.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-m).exp())
}
