//! # Pipeline Configuration
//!
//! Every choice the pipeline makes is read from a [`PipelineConfig`], which is
//! loaded from TOML with defaults for anything left out. Configuration is
//! validated before any data is touched.

use crate::boost::{BoostParams, SearchConfig, SearchStrategy};
use crate::consensus::ConsensusPolicy;
use crate::data::{DEFAULT_MEMBER_COLUMN, DEFAULT_PERIOD_COLUMN, TableSchema, normalize_name};
use crate::explain::FactorOptions;
use crate::linear::LogisticConfig;
use crate::model::ModelKind;
use crate::resample::SmoteConfig;
use crate::split::{Partition, SplitConfig};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Which model families are trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSelection {
    Logistic,
    Boosted,
    Both,
}

impl ModelSelection {
    pub fn kinds(&self) -> Vec<ModelKind> {
        match self {
            ModelSelection::Logistic => vec![ModelKind::Logistic],
            ModelSelection::Boosted => vec![ModelKind::Boosted],
            ModelSelection::Both => vec![ModelKind::Logistic, ModelKind::Boosted],
        }
    }
}

/// Partitions whose rows receive individual records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitInclusion {
    Test,
    ValidationTest,
    All,
}

impl SplitInclusion {
    pub fn partitions(&self) -> &'static [Partition] {
        match self {
            SplitInclusion::Test => &[Partition::Test],
            SplitInclusion::ValidationTest => &[Partition::Validation, Partition::Test],
            SplitInclusion::All => &Partition::ALL,
        }
    }
}

/// How the minority class is compensated for during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImbalanceStrategy {
    /// Balanced logistic class weights and `scale_pos_weight` for the ensemble.
    ClassWeight,
    /// Synthetic minority oversampling of the training matrix.
    Oversample,
    Both,
    None,
}

impl ImbalanceStrategy {
    pub fn weights_classes(&self) -> bool {
        matches!(self, ImbalanceStrategy::ClassWeight | ImbalanceStrategy::Both)
    }

    pub fn oversamples(&self) -> bool {
        matches!(self, ImbalanceStrategy::Oversample | ImbalanceStrategy::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Outcome columns to model, each independently.
    pub targets: Vec<String>,
    pub member_column: String,
    pub period_column: String,
    pub seed: u64,
    pub test_fraction: f64,
    pub validation_fraction: f64,
    pub models: ModelSelection,
    pub imbalance: ImbalanceStrategy,
    pub include_splits: SplitInclusion,
    /// Inclusive recency window on the period column. Rows outside it, or with
    /// no period, get no individual record.
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub epsilon: f64,
    pub top_n: usize,
    pub background_cap: usize,
    pub reconstruction_tolerance: f64,
    /// Equal-width probability bins in each calibration table.
    pub calibration_bins: usize,
    /// Every outcome column in the table; none of them is ever a feature.
    pub outcome_columns: Vec<String>,
    pub exclude_features: Vec<String>,
    pub output_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub run_log: Option<PathBuf>,
    pub consensus: ConsensusPolicy,
    pub logistic: LogisticConfig,
    pub boosting: BoostParams,
    pub search: SearchConfig,
    pub smote: SmoteConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let outcome_columns = ["ed", "ip", "any"]
            .iter()
            .flat_map(|kind| {
                [30, 60, 90]
                    .iter()
                    .map(move |days| format!("{kind}_event_next_{days}d"))
            })
            .chain(std::iter::once("is_active_next_90d".to_string()))
            .collect();
        Self {
            targets: vec!["any_event_next_90d".to_string()],
            member_column: DEFAULT_MEMBER_COLUMN.to_string(),
            period_column: DEFAULT_PERIOD_COLUMN.to_string(),
            seed: 42,
            test_fraction: 0.2,
            validation_fraction: 0.25,
            models: ModelSelection::Both,
            imbalance: ImbalanceStrategy::ClassWeight,
            include_splits: SplitInclusion::Test,
            window_start: NaiveDate::from_ymd_opt(2024, 7, 1),
            window_end: NaiveDate::from_ymd_opt(2024, 12, 1),
            epsilon: 1e-6,
            top_n: 25,
            background_cap: 500,
            reconstruction_tolerance: 1e-3,
            calibration_bins: 10,
            outcome_columns,
            exclude_features: Vec::new(),
            output_dir: PathBuf::from("riskgrouper_output"),
            cache_dir: None,
            run_log: None,
            consensus: ConsensusPolicy::default(),
            logistic: LogisticConfig::default(),
            boosting: BoostParams::default(),
            search: SearchConfig::default(),
            smote: SmoteConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a configuration file. Keys left out take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Lower-cases and trims every column name so it matches the loaded table.
    pub fn normalize(&mut self) {
        let normalize_all = |names: &mut Vec<String>| {
            for name in names.iter_mut() {
                *name = normalize_name(name);
            }
        };
        normalize_all(&mut self.targets);
        normalize_all(&mut self.outcome_columns);
        normalize_all(&mut self.exclude_features);
        self.member_column = normalize_name(&self.member_column);
        self.period_column = normalize_name(&self.period_column);
    }

    /// Checks every value, naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(invalid("targets", "at least one target column is required"));
        }
        if let Some(blank) = self.targets.iter().find(|t| t.trim().is_empty()) {
            return Err(invalid("targets", format!("target name '{blank}' is blank")));
        }
        if self.member_column.trim().is_empty() {
            return Err(invalid("member_column", "must not be blank"));
        }
        for (key, value) in [
            ("test_fraction", self.test_fraction),
            ("validation_fraction", self.validation_fraction),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(invalid(key, format!("{value} is not in [0, 1)")));
            }
        }
        if !(self.epsilon >= 0.0) {
            return Err(invalid("epsilon", "must be non-negative"));
        }
        if self.top_n == 0 {
            return Err(invalid("top_n", "must be at least 1"));
        }
        if self.background_cap == 0 {
            return Err(invalid("background_cap", "must be at least 1"));
        }
        if !(self.reconstruction_tolerance > 0.0) {
            return Err(invalid("reconstruction_tolerance", "must be positive"));
        }
        if self.calibration_bins == 0 {
            return Err(invalid("calibration_bins", "must be at least 1"));
        }
        if let (Some(start), Some(end)) = (self.window_start, self.window_end) {
            if start > end {
                return Err(invalid(
                    "window_start",
                    format!("{start} is after window_end {end}"),
                ));
            }
        }
        self.consensus
            .validate()
            .map_err(|reason| invalid("consensus", reason))?;

        if !(self.logistic.inverse_regularization > 0.0) {
            return Err(invalid("logistic.inverse_regularization", "must be positive"));
        }
        if self.logistic.max_iterations == 0 {
            return Err(invalid("logistic.max_iterations", "must be at least 1"));
        }

        let b = &self.boosting;
        if b.n_estimators == 0 {
            return Err(invalid("boosting.n_estimators", "must be at least 1"));
        }
        if !(1..=32).contains(&b.max_depth) {
            return Err(invalid("boosting.max_depth", "must be between 1 and 32"));
        }
        if !(b.learning_rate > 0.0) {
            return Err(invalid("boosting.learning_rate", "must be positive"));
        }
        for (key, value) in [
            ("boosting.subsample", b.subsample),
            ("boosting.colsample_bytree", b.colsample_bytree),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(key, format!("{value} is not in (0, 1]")));
            }
        }
        if !(2..=u16::MAX as usize).contains(&b.max_bins) {
            return Err(invalid("boosting.max_bins", "must be between 2 and 65535"));
        }

        let s = &self.search;
        if s.strategy != SearchStrategy::Disabled {
            if s.folds < 2 {
                return Err(invalid("search.folds", "must be at least 2"));
            }
            if s.strategy == SearchStrategy::Randomized && s.candidates == 0 {
                return Err(invalid("search.candidates", "must be at least 1"));
            }
            if s.space.max_depth.1 > 33 || s.space.max_depth.0 == 0 {
                return Err(invalid("search.space.max_depth", "depths must lie between 1 and 32"));
            }
            if s.space.n_estimators.0 == 0 || s.space.n_estimators.0 >= s.space.n_estimators.1 {
                return Err(invalid("search.space.n_estimators", "must be a non-empty range above 0"));
            }
            if s.space.max_depth.0 >= s.space.max_depth.1 {
                return Err(invalid("search.space.max_depth", "must be a non-empty range"));
            }
        }
        if self.smote.k_neighbors == 0 {
            return Err(invalid("smote.k_neighbors", "must be at least 1"));
        }
        Ok(())
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema {
            member_column: self.member_column.clone(),
            period_column: self.period_column.clone(),
        }
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            test_fraction: self.test_fraction,
            validation_fraction: self.validation_fraction,
            seed: self.seed,
        }
    }

    /// Columns that never enter the feature set: the configured outcome
    /// columns together with every target of the run.
    pub fn outcome_exclusions(&self) -> Vec<String> {
        let mut columns = self.outcome_columns.clone();
        for target in &self.targets {
            if !columns.contains(target) {
                columns.push(target.clone());
            }
        }
        columns
    }

    pub fn factor_options(&self) -> FactorOptions {
        FactorOptions {
            epsilon: self.epsilon,
            top_n: self.top_n,
        }
    }

    /// Whether `period` falls inside the recency window. Periodless rows are
    /// inside only when no window bound is set.
    pub fn in_window(&self, period: Option<NaiveDate>) -> bool {
        match (period, self.window_start, self.window_end) {
            (_, None, None) => true,
            (None, _, _) => false,
            (Some(p), start, end) => {
                start.is_none_or(|s| p >= s) && end.is_none_or(|e| p <= e)
            }
        }
    }
}
