//! Metric samples and the metric type vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known metric types reported by miners.
///
/// Keys that match none of the named variants are stored verbatim and
/// classified as [`MetricKind::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Hash rate in terahashes per second.
    Hashrate,
    /// Chip or board temperature.
    Temperature,
    /// Power draw.
    Power,
    /// Core or input voltage.
    Voltage,
    /// Fan speed.
    FanSpeed,
    /// Shares accepted by the pool.
    SharesAccepted,
    /// Shares rejected by the pool.
    SharesRejected,
    /// Energy efficiency.
    Efficiency,
    /// Anything else.
    Custom,
}

impl MetricKind {
    /// Returns all metric kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Hashrate,
            Self::Temperature,
            Self::Power,
            Self::Voltage,
            Self::FanSpeed,
            Self::SharesAccepted,
            Self::SharesRejected,
            Self::Efficiency,
            Self::Custom,
        ]
    }

    /// Returns the canonical metric key.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hashrate => "hashrate",
            Self::Temperature => "temperature",
            Self::Power => "power",
            Self::Voltage => "voltage",
            Self::FanSpeed => "fan_speed",
            Self::SharesAccepted => "shares_accepted",
            Self::SharesRejected => "shares_rejected",
            Self::Efficiency => "efficiency",
            Self::Custom => "custom",
        }
    }

    /// Classifies a metric key. Unknown keys map to [`MetricKind::Custom`].
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        match key {
            "hashrate" => Self::Hashrate,
            "temperature" => Self::Temperature,
            "power" => Self::Power,
            "voltage" => Self::Voltage,
            "fan_speed" => Self::FanSpeed,
            "shares_accepted" => Self::SharesAccepted,
            "shares_rejected" => Self::SharesRejected,
            "efficiency" => Self::Efficiency,
            _ => Self::Custom,
        }
    }

    /// Returns the display unit stored alongside samples of this kind.
    #[must_use]
    pub const fn unit(&self) -> Option<&'static str> {
        match self {
            Self::Hashrate => Some("TH/s"),
            Self::Temperature => Some("°C"),
            Self::Power => Some("W"),
            Self::Voltage => Some("V"),
            Self::FanSpeed => Some("RPM"),
            Self::SharesAccepted
            | Self::SharesRejected
            | Self::Efficiency
            | Self::Custom => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns the unit for a metric key, `None` for unknown keys.
#[must_use]
pub fn unit_for(metric_type: &str) -> Option<&'static str> {
    MetricKind::from_key(metric_type).unit()
}

/// One stored metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Row id; later inserts have higher ids.
    pub id: i64,
    /// Owning miner.
    pub miner_id: String,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Metric key as reported by the miner.
    pub metric_type: String,
    /// Sample value.
    pub value: f64,
    /// Unit derived from the metric key.
    pub unit: Option<String>,
}

/// The most recent sample of one metric type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMetric {
    /// Sample value.
    pub value: f64,
    /// Unit derived from the metric key.
    pub unit: Option<String>,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
}
