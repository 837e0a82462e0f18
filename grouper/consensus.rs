//! # Consensus Risk Tiering
//!
//! Combines the logistic and boosted probabilities of a row into one of three
//! risk tiers. The rule is chosen by configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    HighRisk,
    MediumRisk,
    LowRisk,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::HighRisk => "high_risk",
            RiskTier::MediumRisk => "medium_risk",
            RiskTier::LowRisk => "low_risk",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-model probability band: at or above `high` counts as high, at or below
/// `low` counts as low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskBand {
    pub high: f64,
    pub low: f64,
}

impl Default for RiskBand {
    fn default() -> Self {
        Self {
            high: 0.65,
            low: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConsensusPolicy {
    /// High when both models reach their high band, low when both fall to
    /// their low band, medium otherwise.
    DualBand {
        #[serde(default)]
        logistic: RiskBand,
        #[serde(default)]
        boosted: RiskBand,
    },
    /// High when both models are at or above `cutoff`, low when both are
    /// below it, medium otherwise.
    SharedCutoff {
        #[serde(default = "default_cutoff")]
        cutoff: f64,
    },
}

fn default_cutoff() -> f64 {
    0.4
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        ConsensusPolicy::DualBand {
            logistic: RiskBand::default(),
            boosted: RiskBand::default(),
        }
    }
}

impl ConsensusPolicy {
    pub fn shared_cutoff() -> Self {
        ConsensusPolicy::SharedCutoff {
            cutoff: default_cutoff(),
        }
    }

    pub fn classify(&self, logistic: f64, boosted: f64) -> RiskTier {
        match *self {
            ConsensusPolicy::DualBand {
                logistic: lb,
                boosted: bb,
            } => {
                if logistic >= lb.high && boosted >= bb.high {
                    RiskTier::HighRisk
                } else if logistic <= lb.low && boosted <= bb.low {
                    RiskTier::LowRisk
                } else {
                    RiskTier::MediumRisk
                }
            }
            ConsensusPolicy::SharedCutoff { cutoff } => {
                if logistic >= cutoff && boosted >= cutoff {
                    RiskTier::HighRisk
                } else if logistic < cutoff && boosted < cutoff {
                    RiskTier::LowRisk
                } else {
                    RiskTier::MediumRisk
                }
            }
        }
    }

    /// Describes the first out-of-range threshold, if any.
    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        match self {
            ConsensusPolicy::DualBand { logistic, boosted } => {
                for (name, band) in [("logistic", logistic), ("boosted", boosted)] {
                    if !in_unit(band.high) || !in_unit(band.low) {
                        return Err(format!("{name} band thresholds must lie in [0, 1]"));
                    }
                    if band.low >= band.high {
                        return Err(format!(
                            "{name} band low ({}) must be below high ({})",
                            band.low, band.high
                        ));
                    }
                }
                Ok(())
            }
            ConsensusPolicy::SharedCutoff { cutoff } => {
                if in_unit(*cutoff) {
                    Ok(())
                } else {
                    Err(format!("cutoff {cutoff} must lie in [0, 1]"))
                }
            }
        }
    }
}
