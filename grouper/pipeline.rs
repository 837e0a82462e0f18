//! # Pipeline Orchestration
//!
//! A [`RunContext`] owns the validated configuration for one run. [`run`]
//! checks every target column up front, then processes each target on its own:
//!
//! 1. split members into train / validation / test,
//! 2. select features from the training partition,
//! 3. train each configured model on the (optionally oversampled) training rows,
//! 4. choose each model's threshold on the validation partition,
//! 5. score every partition and compute metrics,
//! 6. explain the reported rows, tier them by consensus, and assemble records.
//!
//! A target that lacks the data to train is skipped with a reason, and a
//! target that fails is reported as failed; neither stops the other targets.

use crate::boost::{SearchOutcome, train_boosted};
use crate::config::{ConfigError, PipelineConfig};
use crate::data::{ColumnData, MemberTable};
use crate::explain::{
    Explainer, ExplainerCache, ReconstructionSummary, RowAttribution, global_factors,
    sample_background,
};
use crate::features::{FeatureSet, select_features};
use crate::linear::{LogisticConfig, LogisticModel};
use crate::metrics::{calibration_bins, calibration_edges, compute_metrics};
use crate::model::{Classifier, ModelKind, TrainedModel, TrainingError};
use crate::report::{
    AssemblyContext, CalibrationTable, DroppedModel, ModelOutputs, ModelSummary, PartitionRows,
    PartitionScores, ReportError, RunLogEntry, TargetReport, TargetStatus, append_run_log,
    assemble_records, write_json, write_target_report,
};
use crate::resample::oversample_minority;
use crate::split::{Partition, split_by_member};
use crate::threshold::{
    OperatingPoint, PrecisionRecallCurve, ThresholdChoice, operating_points, optimal_f1_threshold,
};
use log::{error, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Thresholds at which precision and recall are summarized in the log.
const SUMMARY_THRESHOLDS: [f64; 3] = [0.2, 0.5, 0.8];

/// Below this share of rows reconstructing within tolerance, the explainer is
/// reported as degraded.
const MIN_RECONSTRUCTED_SHARE: f64 = 0.95;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("This run context has already been used; create a new one for each run.")]
    AlreadyStarted,
    #[error("Target column '{0}' was not found in the input table.")]
    TargetNotFound(String),
    #[error("Target column '{0}' is not numeric.")]
    TargetNotNumeric(String),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Everything one run needs, passed explicitly.
#[derive(Debug)]
pub struct RunContext {
    config: PipelineConfig,
    started: AtomicBool,
}

impl RunContext {
    /// Normalizes and validates `config`.
    pub fn new(mut config: PipelineConfig) -> Result<Self, PipelineError> {
        config.normalize();
        config.validate()?;
        Ok(Self {
            config,
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Marks the context as used. Fails if it already was.
    pub fn begin(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reports: Vec<TargetReport>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status == TargetStatus::Completed)
            .count()
    }

    pub fn report(&self, target: &str) -> Option<&TargetReport> {
        self.reports.iter().find(|r| r.target == target)
    }
}

/// Runs every configured target over `table`.
pub fn run(context: &RunContext, table: &MemberTable) -> Result<RunSummary, PipelineError> {
    context.begin()?;
    let config = context.config();
    validate_targets(table, &config.targets)?;

    let cache = config
        .cache_dir
        .as_ref()
        .and_then(|dir| match ExplainerCache::open(dir) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(
                    "Explainer cache at {} is unavailable ({e}); explainers will be rebuilt.",
                    dir.display()
                );
                None
            }
        });

    let mut reports = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        info!("==== Target '{target}' ====");
        let report = run_target(config, table, target, cache.as_ref());
        match &report.status {
            TargetStatus::Completed => info!(
                "Target '{target}' completed with {} records.",
                report.records.len()
            ),
            TargetStatus::Skipped(reason) => warn!("Target '{target}' skipped: {reason}"),
            TargetStatus::Failed(reason) => error!("Target '{target}' failed: {reason}"),
        }
        if let Some(path) = &config.run_log {
            if let Err(e) = append_run_log(path, &RunLogEntry::from_report(&report)) {
                warn!("Could not append to run log {}: {e}", path.display());
            }
        }
        reports.push(report);
    }
    Ok(RunSummary { reports })
}

#[derive(Serialize)]
struct RunOverview<'a> {
    target: &'a str,
    status: &'a str,
    reason: Option<&'a str>,
    records: usize,
}

/// Writes every target's outputs and a run overview under the output directory.
pub fn write_outputs(
    context: &RunContext,
    summary: &RunSummary,
) -> Result<Vec<PathBuf>, PipelineError> {
    let dir = &context.config().output_dir;
    let mut written = Vec::new();
    for report in &summary.reports {
        written.extend(write_target_report(dir, report)?);
    }
    let overview: Vec<RunOverview<'_>> = summary
        .reports
        .iter()
        .map(|r| RunOverview {
            target: &r.target,
            status: r.status.as_str(),
            reason: r.status.reason(),
            records: r.records.len(),
        })
        .collect();
    let path = dir.join("run_summary.json");
    write_json(&path, &overview)?;
    written.push(path);
    Ok(written)
}

/// Every target must exist and be numeric before anything is trained.
fn validate_targets(table: &MemberTable, targets: &[String]) -> Result<(), PipelineError> {
    if table.is_empty() {
        return Ok(());
    }
    for target in targets {
        match table.column(target) {
            None => return Err(PipelineError::TargetNotFound(target.clone())),
            Some(ColumnData::Text(_)) => {
                return Err(PipelineError::TargetNotNumeric(target.clone()));
            }
            Some(ColumnData::Numeric(_)) => {}
        }
    }
    Ok(())
}

/// A trained model together with everything derived from it.
struct ModelArm {
    model: TrainedModel,
    fingerprint: String,
    search: Option<SearchOutcome>,
    threshold: ThresholdChoice,
    curve: PrecisionRecallCurve,
    operating_points: Vec<OperatingPoint>,
    explainer: Option<Explainer>,
}

/// One partition's design matrix, labels, and per-model probabilities.
struct ScoredPartition<'a> {
    split: Partition,
    table: &'a MemberTable,
    x: Array2<f64>,
    y: Array1<f64>,
    /// Indexed like the model arms.
    probabilities: Vec<Array1<f64>>,
}

fn run_target(
    config: &PipelineConfig,
    table: &MemberTable,
    target: &str,
    cache: Option<&ExplainerCache>,
) -> TargetReport {
    match internal::process_target(config, table, target, cache) {
        Ok(report) => report,
        Err(status) => TargetReport::new(target, status),
    }
}

mod internal {
    use super::*;

    fn labels(table: &MemberTable, target: &str) -> Array1<f64> {
        table
            .numeric(target)
            .cloned()
            .unwrap_or_else(|| Array1::zeros(table.len()))
    }

    fn skipped(reason: impl Into<String>) -> TargetStatus {
        TargetStatus::Skipped(reason.into())
    }

    fn failed(reason: impl Into<String>) -> TargetStatus {
        TargetStatus::Failed(reason.into())
    }

    pub(super) fn process_target(
        config: &PipelineConfig,
        table: &MemberTable,
        target: &str,
        cache: Option<&ExplainerCache>,
    ) -> Result<TargetReport, TargetStatus> {
        process_target_with(config, table, target, cache, |kind, x, y, features| {
            train_model(config, kind, x, y, features)
        })
    }

    /// Runs one target with `train` fitting each configured model family. A
    /// family whose training or scoring fails is dropped from the report; the
    /// target fails only when no family survives.
    pub(super) fn process_target_with<F>(
        config: &PipelineConfig,
        table: &MemberTable,
        target: &str,
        cache: Option<&ExplainerCache>,
        mut train: F,
    ) -> Result<TargetReport, TargetStatus>
    where
        F: FnMut(
            ModelKind,
            &Array2<f64>,
            &Array1<f64>,
            &FeatureSet,
        ) -> Result<(TrainedModel, Option<SearchOutcome>), TargetStatus>,
    {
        let splits = split_by_member(table, target, &config.split_config())
            .map_err(|e| failed(e.to_string()))?;
        let rows = PartitionRows {
            train: splits.train.len(),
            validation: splits.validation.len(),
            test: splits.test.len(),
        };
        if splits.train.is_empty() {
            return Err(skipped("the training partition is empty"));
        }
        if splits.validation.is_empty() {
            return Err(skipped(
                "the validation partition is empty, so no threshold can be chosen",
            ));
        }

        let y_train = labels(&splits.train, target);
        let positives = y_train.iter().filter(|&&v| v == 1.0).count();
        if positives == 0 || positives == y_train.len() {
            return Err(skipped(format!(
                "the training partition holds a single class ({} rows, {positives} positive)",
                y_train.len()
            )));
        }

        let selection = select_features(
            &splits.train,
            target,
            &config.exclude_features,
            &config.outcome_exclusions(),
        );
        if selection.features.is_empty() {
            return Err(skipped("no numeric feature columns remain after exclusions"));
        }
        let features = FeatureSet::from_training(&splits.train, selection.features);
        let x_train = features.design_matrix(&splits.train);

        let (x_fit, y_fit) = if config.imbalance.oversamples() {
            match oversample_minority(x_train.view(), y_train.view(), &config.smote) {
                Ok((x, y)) => {
                    info!(
                        "Oversampled the training partition from {} to {} rows.",
                        x_train.nrows(),
                        x.nrows()
                    );
                    (x, y)
                }
                Err(e) => {
                    warn!("Oversampling failed ({e}); training on the original rows.");
                    (x_train.clone(), y_train.clone())
                }
            }
        } else {
            (x_train.clone(), y_train.clone())
        };

        let mut partitions: Vec<ScoredPartition<'_>> = Partition::ALL
            .iter()
            .map(|&split| {
                let part = splits.partition(split);
                ScoredPartition {
                    split,
                    table: part,
                    x: features.design_matrix(part),
                    y: labels(part, target),
                    probabilities: Vec::new(),
                }
            })
            .collect();

        // Train, then choose thresholds on validation.
        let mut arms = Vec::new();
        let mut dropped: Vec<(ModelKind, TargetStatus)> = Vec::new();
        for kind in config.models.kinds() {
            let fitted = train(kind, &x_fit, &y_fit, &features)
                .and_then(|(model, search)| score_arm(model, search, &partitions));
            match fitted {
                Ok((arm, probabilities)) => {
                    for (partition, p) in partitions.iter_mut().zip(probabilities) {
                        partition.probabilities.push(p);
                    }
                    arms.push(arm);
                }
                Err(status) => {
                    warn!(
                        "Dropping the {kind} model for '{target}': {}",
                        status.reason().unwrap_or_default()
                    );
                    dropped.push((kind, status));
                }
            }
        }
        if arms.is_empty() {
            let status = dropped
                .iter()
                .find(|(_, s)| matches!(s, TargetStatus::Failed(_)))
                .or(dropped.first())
                .map(|(_, s)| s.clone())
                .unwrap_or_else(|| failed("no model family is configured"));
            return Err(status);
        }

        let mut metrics = Vec::new();
        for (a, arm) in arms.iter().enumerate() {
            for partition in &partitions {
                let m = compute_metrics(
                    target,
                    arm.model.kind(),
                    partition.split,
                    partition.y.view(),
                    partition.probabilities[a].view(),
                    arm.threshold.threshold,
                );
                info!(
                    "{} on {}: ROC-AUC {}, PR-AUC {}, F1 {:.4}",
                    m.model,
                    m.split,
                    m.roc_auc.map_or("undefined".to_string(), |v| format!("{v:.4}")),
                    m.pr_auc.map_or("undefined".to_string(), |v| format!("{v:.4}")),
                    m.f1
                );
                metrics.push(m);
            }
        }

        // Explainers share one background sample drawn from the training rows.
        let background = sample_background(x_train.view(), config.background_cap, config.seed);
        for arm in arms.iter_mut() {
            let built = match cache {
                Some(cache) => cache.get_or_build(&arm.model, background.clone()),
                None => Explainer::build(&arm.model, background.clone()),
            };
            arm.explainer = match built {
                Ok(explainer) => Some(explainer),
                Err(e) => {
                    warn!(
                        "No {} explainer could be built ({e}); explanations will be placeholders.",
                        arm.model.kind()
                    );
                    None
                }
            };
        }

        let options = config.factor_options();
        let context = AssemblyContext {
            target,
            features: &features,
            factors: options,
            consensus: config.consensus,
        };
        let mut records = Vec::new();
        let mut calibration = Vec::new();
        let mut global = vec![Vec::new(); arms.len()];
        let mut all_attributions: Vec<Vec<Option<RowAttribution>>> = vec![Vec::new(); arms.len()];

        for partition in partitions
            .iter()
            .filter(|p| config.include_splits.partitions().contains(&p.split))
        {
            let window_rows: Vec<usize> = (0..partition.table.len())
                .filter(|&i| config.in_window(partition.table.periods()[i]))
                .collect();
            let x_window = partition.x.select(Axis(0), &window_rows);

            let window_labels = partition.y.select(Axis(0), &window_rows);
            let window_scores: Vec<Array1<f64>> = partition
                .probabilities
                .iter()
                .map(|p| p.select(Axis(0), &window_rows))
                .collect();
            let views: Vec<ArrayView1<'_, f64>> = window_scores.iter().map(|p| p.view()).collect();
            let edges = calibration_edges(&views, config.calibration_bins);
            for (arm, scores) in arms.iter().zip(&views) {
                calibration.push(CalibrationTable {
                    model: arm.model.kind(),
                    split: partition.split,
                    bins: calibration_bins(window_labels.view(), *scores, &edges),
                });
            }

            let attributions: Vec<Vec<Option<RowAttribution>>> = arms
                .iter()
                .map(|arm| match &arm.explainer {
                    Some(explainer) => explainer
                        .explain(&arm.model, x_window.view())
                        .unwrap_or_else(|e| {
                            warn!("{} attribution failed on {}: {e}", arm.model.kind(), partition.split);
                            vec![None; window_rows.len()]
                        }),
                    None => vec![None; window_rows.len()],
                })
                .collect();

            for (a, arm) in arms.iter().enumerate() {
                let factors = global_factors(&attributions[a], features.names(), &options);
                if let Some(top) = factors.first() {
                    info!(
                        "{} on {}: top global factor '{}' ({:.4})",
                        arm.model.kind(),
                        partition.split,
                        top.feature,
                        top.mean_abs_contribution
                    );
                }
                global[a].push((partition.split, factors));
                all_attributions[a].extend(attributions[a].iter().cloned());
            }

            let outputs = |kind: ModelKind| {
                arms.iter()
                    .position(|arm| arm.model.kind() == kind)
                    .map(|a| ModelOutputs {
                        model: &arms[a].model,
                        threshold: arms[a].threshold.threshold,
                        probabilities: partition.probabilities[a].view(),
                        attributions: &attributions[a],
                    })
            };
            let scores = PartitionScores {
                split: partition.split,
                table: partition.table,
                x: partition.x.view(),
                labels: partition.y.view(),
                rows: &window_rows,
                logistic: outputs(ModelKind::Logistic),
                boosted: outputs(ModelKind::Boosted),
            };
            records.extend(assemble_records(&context, &scores));
        }

        let mut models = Vec::with_capacity(arms.len());
        let mut trained = Vec::with_capacity(arms.len());
        for ((arm, global_factors), attributions) in
            arms.into_iter().zip(global).zip(&all_attributions)
        {
            let reconstruction = arm.explainer.as_ref().map(|_| {
                let summary = ReconstructionSummary::from_attributions(
                    attributions,
                    config.reconstruction_tolerance,
                );
                if summary.fraction_within() < MIN_RECONSTRUCTED_SHARE {
                    warn!(
                        "Only {:.1}% of {} explanations reconstruct within {}; max error {:.3e}.",
                        100.0 * summary.fraction_within(),
                        arm.model.kind(),
                        summary.tolerance,
                        summary.max_error
                    );
                }
                summary
            });
            models.push(ModelSummary {
                kind: arm.model.kind(),
                fingerprint: arm.fingerprint,
                threshold: arm.threshold,
                operating_points: arm.operating_points,
                curve: arm.curve,
                global_factors,
                reconstruction,
                search: arm.search,
            });
            trained.push(arm.model);
        }

        Ok(TargetReport {
            target: target.to_string(),
            status: TargetStatus::Completed,
            features: features.names().to_vec(),
            rows,
            models,
            metrics,
            calibration,
            dropped_models: dropped
                .into_iter()
                .map(|(kind, status)| DroppedModel {
                    kind,
                    reason: status.reason().unwrap_or_default().to_string(),
                })
                .collect(),
            records,
            trained,
        })
    }

    /// Scores every partition with `model` and chooses its threshold on the
    /// validation partition. Returns the arm and one probability vector per
    /// partition, in partition order.
    fn score_arm(
        model: TrainedModel,
        search: Option<SearchOutcome>,
        partitions: &[ScoredPartition<'_>],
    ) -> Result<(ModelArm, Vec<Array1<f64>>), TargetStatus> {
        let kind = model.kind();
        let probabilities = partitions
            .iter()
            .map(|partition| model.predict_probability(partition.x.view()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| failed(format!("{kind} scoring failed: {e}")))?;
        let fingerprint = model
            .fingerprint()
            .map_err(|e| failed(format!("{kind} model could not be fingerprinted: {e}")))?;

        let validation = Partition::Validation as usize;
        let labels = partitions[validation].y.view();
        let scores = probabilities[validation].view();
        let (threshold, curve) = optimal_f1_threshold(labels, scores)
            .map_err(|e| failed(format!("{kind} threshold selection failed: {e}")))?;
        let points = operating_points(labels, scores, &SUMMARY_THRESHOLDS);
        info!(
            "{kind} threshold {:.4} (validation F1 {:.4}, precision {:.4}, recall {:.4})",
            threshold.threshold, threshold.f1, threshold.precision, threshold.recall
        );
        for point in &points {
            info!(
                "  {kind} at {:.1}: precision {:.4}, recall {:.4}",
                point.threshold, point.precision, point.recall
            );
        }
        let arm = ModelArm {
            model,
            fingerprint,
            search,
            threshold,
            curve,
            operating_points: points,
            explainer: None,
        };
        Ok((arm, probabilities))
    }

    pub(super) fn train_model(
        config: &PipelineConfig,
        kind: ModelKind,
        x: &Array2<f64>,
        y: &Array1<f64>,
        features: &FeatureSet,
    ) -> Result<(TrainedModel, Option<SearchOutcome>), TargetStatus> {
        let classify_error = |e: TrainingError| match e {
            TrainingError::SingleClass { .. } | TrainingError::EmptyTrainingSet => {
                skipped(format!("{kind} model cannot be trained: {e}"))
            }
            other => failed(format!("{kind} training failed: {other}")),
        };
        info!("Training {kind} model on {} rows x {} features.", x.nrows(), x.ncols());
        match kind {
            ModelKind::Logistic => {
                let logistic_config = LogisticConfig {
                    balanced_class_weight: config.imbalance.weights_classes(),
                    ..config.logistic.clone()
                };
                let model = LogisticModel::fit(x.view(), y.view(), features.names(), &logistic_config)
                    .map_err(classify_error)?;
                Ok((model.into(), None))
            }
            ModelKind::Boosted => {
                let (model, search) = train_boosted(
                    x.view(),
                    y.view(),
                    features.names(),
                    &config.boosting,
                    &config.search,
                    config.imbalance.weights_classes(),
                )
                .map_err(classify_error)?;
                if let Some(outcome) = &search {
                    info!(
                        "Chose boosted parameters by {}-fold search (mean ROC-AUC {}): {:?}",
                        outcome.folds,
                        outcome
                            .best_auc
                            .map_or("undefined".to_string(), |v| format!("{v:.4}")),
                        outcome.best
                    );
                }
                Ok((model.into(), search))
            }
        }
    }
}
