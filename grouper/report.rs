//! # Reporting Assembly
//!
//! Merges scores, thresholds, explanations, consensus tiers and score
//! build-ups into one [`IndividualRecord`] per reported row, and writes the
//! per-target outputs. Every file is written to a temporary sibling and renamed
//! into place, so a failed run never leaves a half-written output behind.

use crate::boost::SearchOutcome;
use crate::consensus::{ConsensusPolicy, RiskTier};
use crate::data::MemberTable;
use crate::explain::{
    Factor, FactorOptions, GlobalFactor, LocalExplanation, ReconstructionSummary, RowAttribution,
    local_factors,
};
use crate::features::FeatureSet;
use crate::linear::ScoreBuildUp;
use crate::metrics::{CalibrationBin, ClassificationMetrics, PseudoR2};
use crate::model::{ModelError, ModelKind, TrainedModel};
use crate::split::Partition;
use crate::threshold::{OperatingPoint, PrecisionRecallCurve, ThresholdChoice};
use chrono::{NaiveDate, Utc};
use log::info;
use ndarray::{ArrayView1, ArrayView2};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize report JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to save trained model: {0}")]
    Model(#[from] ModelError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ========================================================================================
//                                Per-individual records
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelScore {
    pub probability: f64,
    pub predicted_label: u8,
    pub threshold: f64,
}

/// The ensemble's prediction as base value plus per-feature contributions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionBuildUp {
    pub base_value: f64,
    pub contributions: Vec<Factor>,
    pub total: f64,
}

impl AttributionBuildUp {
    fn from_attribution(attribution: &RowAttribution, feature_names: &[String]) -> Self {
        Self {
            base_value: attribution.base_value,
            contributions: feature_names
                .iter()
                .zip(&attribution.contributions)
                .map(|(feature, &contribution)| Factor {
                    feature: feature.clone(),
                    contribution,
                })
                .collect(),
            total: attribution.base_value + attribution.contributions.iter().sum::<f64>(),
        }
    }
}

/// Everything reported for one member-period row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndividualRecord {
    pub target: String,
    pub member_id: String,
    pub period: Option<NaiveDate>,
    pub split: Partition,
    pub actual: u8,
    pub logistic: Option<ModelScore>,
    pub boosted: Option<ModelScore>,
    pub logistic_explanation: Option<LocalExplanation>,
    pub boosted_explanation: Option<LocalExplanation>,
    /// Only present when both models were trained.
    pub risk_tier: Option<RiskTier>,
    pub logistic_build_up: Option<ScoreBuildUp>,
    pub boosted_build_up: Option<AttributionBuildUp>,
}

/// One model's outputs over a partition.
pub struct ModelOutputs<'a> {
    pub model: &'a TrainedModel,
    pub threshold: f64,
    /// One probability per partition row.
    pub probabilities: ArrayView1<'a, f64>,
    /// One attribution per reported row, aligned with [`PartitionScores::rows`].
    pub attributions: &'a [Option<RowAttribution>],
}

/// A scored partition ready for record assembly.
pub struct PartitionScores<'a> {
    pub split: Partition,
    pub table: &'a MemberTable,
    pub x: ArrayView2<'a, f64>,
    pub labels: ArrayView1<'a, f64>,
    /// Partition rows that receive records, in order.
    pub rows: &'a [usize],
    pub logistic: Option<ModelOutputs<'a>>,
    pub boosted: Option<ModelOutputs<'a>>,
}

/// Settings shared by every record of one target.
pub struct AssemblyContext<'a> {
    pub target: &'a str,
    pub features: &'a FeatureSet,
    pub factors: FactorOptions,
    pub consensus: ConsensusPolicy,
}

pub fn assemble_records(
    context: &AssemblyContext<'_>,
    partition: &PartitionScores<'_>,
) -> Vec<IndividualRecord> {
    let score = |outputs: &ModelOutputs<'_>, row: usize| {
        let probability = outputs.probabilities[row];
        ModelScore {
            probability,
            predicted_label: u8::from(probability >= outputs.threshold),
            threshold: outputs.threshold,
        }
    };
    let explanation = |outputs: &ModelOutputs<'_>, k: usize, row: usize| {
        local_factors(
            outputs.attributions.get(k).and_then(Option::as_ref),
            partition.x.row(row),
            context.features,
            &context.factors,
        )
    };

    partition
        .rows
        .iter()
        .enumerate()
        .map(|(k, &row)| {
            let logistic = partition.logistic.as_ref().map(|o| score(o, row));
            let boosted = partition.boosted.as_ref().map(|o| score(o, row));
            let risk_tier = match (logistic, boosted) {
                (Some(l), Some(b)) => Some(context.consensus.classify(l.probability, b.probability)),
                _ => None,
            };
            let logistic_build_up = partition.logistic.as_ref().and_then(|o| match o.model {
                TrainedModel::Logistic(m) => Some(m.score_build_up(partition.x.row(row))),
                TrainedModel::Boosted(_) => None,
            });
            let boosted_build_up = partition.boosted.as_ref().and_then(|o| {
                o.attributions
                    .get(k)
                    .and_then(Option::as_ref)
                    .map(|a| AttributionBuildUp::from_attribution(a, context.features.names()))
            });
            IndividualRecord {
                target: context.target.to_string(),
                member_id: partition.table.member_ids()[row].clone(),
                period: partition.table.periods()[row],
                split: partition.split,
                actual: u8::from(partition.labels[row] == 1.0),
                logistic,
                boosted,
                logistic_explanation: partition.logistic.as_ref().map(|o| explanation(o, k, row)),
                boosted_explanation: partition.boosted.as_ref().map(|o| explanation(o, k, row)),
                risk_tier,
                logistic_build_up,
                boosted_build_up,
            }
        })
        .collect()
}

// ========================================================================================
//                                    Target reports
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TargetStatus {
    Completed,
    Skipped(String),
    Failed(String),
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Completed => "completed",
            TargetStatus::Skipped(_) => "skipped",
            TargetStatus::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TargetStatus::Completed => None,
            TargetStatus::Skipped(r) | TargetStatus::Failed(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PartitionRows {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

impl PartitionRows {
    pub fn count(&self, split: Partition) -> usize {
        match split {
            Partition::Train => self.train,
            Partition::Validation => self.validation,
            Partition::Test => self.test,
        }
    }
}

/// What one trained model contributed to a target's report.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub kind: ModelKind,
    pub fingerprint: String,
    pub threshold: ThresholdChoice,
    pub operating_points: Vec<OperatingPoint>,
    pub curve: PrecisionRecallCurve,
    /// Global factors per reported partition.
    pub global_factors: Vec<(Partition, Vec<GlobalFactor>)>,
    pub reconstruction: Option<ReconstructionSummary>,
    pub search: Option<SearchOutcome>,
}

/// Observed event rate against predicted probability for one model on one
/// partition's reported rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationTable {
    pub model: ModelKind,
    pub split: Partition,
    pub bins: Vec<CalibrationBin>,
}

/// A configured model that produced no results for the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedModel {
    pub kind: ModelKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    #[serde(flatten)]
    pub status: TargetStatus,
    pub features: Vec<String>,
    pub rows: PartitionRows,
    pub models: Vec<ModelSummary>,
    pub metrics: Vec<ClassificationMetrics>,
    pub calibration: Vec<CalibrationTable>,
    pub dropped_models: Vec<DroppedModel>,
    #[serde(skip)]
    pub records: Vec<IndividualRecord>,
    #[serde(skip)]
    pub trained: Vec<TrainedModel>,
}

impl TargetReport {
    pub fn new(target: &str, status: TargetStatus) -> Self {
        Self {
            target: target.to_string(),
            status,
            features: Vec::new(),
            rows: PartitionRows::default(),
            models: Vec::new(),
            metrics: Vec::new(),
            calibration: Vec::new(),
            dropped_models: Vec::new(),
            records: Vec::new(),
            trained: Vec::new(),
        }
    }

    pub fn model(&self, kind: ModelKind) -> Option<&ModelSummary> {
        self.models.iter().find(|m| m.kind == kind)
    }

    pub fn metric(&self, kind: ModelKind, split: Partition) -> Option<&ClassificationMetrics> {
        self.metrics.iter().find(|m| m.model == kind && m.split == split)
    }
}

// ========================================================================================
//                                       Writers
// ========================================================================================

/// Writes through a temporary sibling of `path`, renaming it into place once
/// `write` succeeds.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), ReportError>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> Result<(), ReportError>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let file = fs::File::create(&tmp).map_err(io_error(&tmp))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush().map_err(io_error(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_error(path))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    write_atomically(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        w.write_all(b"\n").map_err(io_error(path))
    })
}

/// One JSON object per line.
pub fn write_records_jsonl(path: &Path, records: &[IndividualRecord]) -> Result<(), ReportError> {
    write_atomically(path, |w| {
        for record in records {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n").map_err(io_error(path))?;
        }
        Ok(())
    })
}

/// A metrics row with the confusion counts spread into columns.
#[derive(Debug, Serialize)]
struct MetricsRow<'a> {
    target: &'a str,
    model: ModelKind,
    split: Partition,
    rows: usize,
    positives: usize,
    roc_auc: Option<f64>,
    pr_auc: Option<f64>,
    f1: f64,
    precision: f64,
    recall: f64,
    accuracy: f64,
    tp: usize,
    fp: usize,
    tn: usize,
    #[serde(rename = "fn")]
    fn_: usize,
    threshold_used: f64,
    pseudo_r2: String,
}

impl<'a> From<&'a ClassificationMetrics> for MetricsRow<'a> {
    fn from(m: &'a ClassificationMetrics) -> Self {
        Self {
            target: &m.target,
            model: m.model,
            split: m.split,
            rows: m.rows,
            positives: m.positives,
            roc_auc: m.roc_auc,
            pr_auc: m.pr_auc,
            f1: m.f1,
            precision: m.precision,
            recall: m.recall,
            accuracy: m.accuracy,
            tp: m.confusion.tp,
            fp: m.confusion.fp,
            tn: m.confusion.tn,
            fn_: m.confusion.fn_,
            threshold_used: m.threshold_used,
            pseudo_r2: match m.pseudo_r2 {
                PseudoR2::Value(v) => v.to_string(),
                PseudoR2::Undefined => String::new(),
                PseudoR2::NotApplicable => "N/A".to_string(),
            },
        }
    }
}

pub fn write_metrics_csv(path: &Path, metrics: &[ClassificationMetrics]) -> Result<(), ReportError> {
    write_atomically(path, |w| {
        let mut writer = csv::Writer::from_writer(&mut *w);
        for m in metrics {
            writer.serialize(MetricsRow::from(m))?;
        }
        writer.flush().map_err(io_error(path))?;
        Ok(())
    })
}

#[derive(Debug, Serialize)]
struct CalibrationRow<'a> {
    target: &'a str,
    model: ModelKind,
    split: Partition,
    bin: usize,
    lower: f64,
    upper: f64,
    count: usize,
    predicted_events: f64,
    actual_events: usize,
    mean_score: Option<f64>,
    calibration_percent: Option<f64>,
}

/// One CSV row per (model, partition, bin).
pub fn write_calibration_csv(
    path: &Path,
    target: &str,
    tables: &[CalibrationTable],
) -> Result<(), ReportError> {
    write_atomically(path, |w| {
        let mut writer = csv::Writer::from_writer(&mut *w);
        for table in tables {
            for (bin, b) in table.bins.iter().enumerate() {
                writer.serialize(CalibrationRow {
                    target,
                    model: table.model,
                    split: table.split,
                    bin,
                    lower: b.lower,
                    upper: b.upper,
                    count: b.count,
                    predicted_events: b.predicted_events,
                    actual_events: b.actual_events,
                    mean_score: b.mean_score,
                    calibration_percent: b.calibration_percent,
                })?;
            }
        }
        writer.flush().map_err(io_error(path))?;
        Ok(())
    })
}

/// Writes every output of one target under `dir/<target>/` and returns the
/// paths written.
pub fn write_target_report(dir: &Path, report: &TargetReport) -> Result<Vec<PathBuf>, ReportError> {
    let target_dir = dir.join(&report.target);
    fs::create_dir_all(&target_dir).map_err(io_error(&target_dir))?;
    let mut written = Vec::new();

    let summary = target_dir.join("summary.json");
    write_json(&summary, report)?;
    written.push(summary);

    if report.status != TargetStatus::Completed {
        return Ok(written);
    }

    let records = target_dir.join("records.jsonl");
    write_records_jsonl(&records, &report.records)?;
    written.push(records);

    let metrics_json = target_dir.join("metrics.json");
    write_json(&metrics_json, &report.metrics)?;
    written.push(metrics_json);

    let metrics_csv = target_dir.join("metrics.csv");
    write_metrics_csv(&metrics_csv, &report.metrics)?;
    written.push(metrics_csv);

    let calibration = target_dir.join("calibration.csv");
    write_calibration_csv(&calibration, &report.target, &report.calibration)?;
    written.push(calibration);

    let global: Vec<(ModelKind, &Vec<(Partition, Vec<GlobalFactor>)>)> = report
        .models
        .iter()
        .map(|m| (m.kind, &m.global_factors))
        .collect();
    let global_path = target_dir.join("global_factors.json");
    write_json(&global_path, &global)?;
    written.push(global_path);

    let curves: Vec<(ModelKind, &PrecisionRecallCurve)> =
        report.models.iter().map(|m| (m.kind, &m.curve)).collect();
    let curves_path = target_dir.join("pr_curves.json");
    write_json(&curves_path, &curves)?;
    written.push(curves_path);

    for model in &report.trained {
        let path = target_dir.join(format!("{}_model.toml", model.kind()));
        let tmp = path.with_extension("toml.tmp");
        model.save(&tmp)?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        written.push(path);
    }

    info!(
        "Wrote {} output files for target '{}' to {}.",
        written.len(),
        report.target,
        target_dir.display()
    );
    Ok(written)
}

// ========================================================================================
//                                       Run log
// ========================================================================================

/// One row of the CSV run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub timestamp: String,
    pub target: String,
    pub status: String,
    pub reason: String,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub test_rows: usize,
    pub features: usize,
    pub logistic_threshold: Option<f64>,
    pub boosted_threshold: Option<f64>,
    pub logistic_test_auc: Option<f64>,
    pub boosted_test_auc: Option<f64>,
    pub records: usize,
}

impl RunLogEntry {
    pub fn from_report(report: &TargetReport) -> Self {
        let threshold = |kind| report.model(kind).map(|m| m.threshold.threshold);
        let test_auc = |kind| report.metric(kind, Partition::Test).and_then(|m| m.roc_auc);
        Self {
            timestamp: Utc::now().to_rfc3339(),
            target: report.target.clone(),
            status: report.status.as_str().to_string(),
            reason: report.status.reason().unwrap_or_default().to_string(),
            train_rows: report.rows.train,
            validation_rows: report.rows.validation,
            test_rows: report.rows.test,
            features: report.features.len(),
            logistic_threshold: threshold(ModelKind::Logistic),
            boosted_threshold: threshold(ModelKind::Boosted),
            logistic_test_auc: test_auc(ModelKind::Logistic),
            boosted_test_auc: test_auc(ModelKind::Boosted),
            records: report.records.len(),
        }
    }

    /// An entry for a run that failed before any target was processed.
    pub fn fatal(reason: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            target: String::new(),
            status: "failed".to_string(),
            reason: reason.to_string(),
            train_rows: 0,
            validation_rows: 0,
            test_rows: 0,
            features: 0,
            logistic_threshold: None,
            boosted_threshold: None,
            logistic_test_auc: None,
            boosted_test_auc: None,
            records: 0,
        }
    }
}

/// Appends `entry` to the run log, writing the header only when the file is new.
pub fn append_run_log(path: &Path, entry: &RunLogEntry) -> Result<(), ReportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let is_new = !path.exists();
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(is_new)
        .from_writer(file);
    writer.serialize(entry)?;
    writer.flush().map_err(io_error(path))?;
    Ok(())
}
