//! Fixed-width time buckets and per-bucket summary statistics.
//!
//! # Bucket Semantics
//!
//! Buckets are aligned to the Unix epoch: a sample at `t` seconds belongs to
//! the bucket starting at `t - t mod width`. Buckets are left-closed, so a
//! sample exactly on a boundary starts a new bucket. Buckets without samples
//! are never produced.
//!
//! | Interval | Sample | Bucket start |
//! |----------|--------|--------------|
//! | `1h` | `10:00:00` | `10:00:00` |
//! | `1h` | `10:59:59.9` | `10:00:00` |
//! | `5m` | `10:07:30` | `10:05:00` |

use super::MetricPoint;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Aggregation bucket width, parsed from strings like `5m`, `1h` or `1d`.
///
/// Accepted units are `s`, `m` (or `min`), `h` and `d`. The count must be at
/// least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval {
    seconds: u32,
}

impl Interval {
    /// Five minutes.
    pub const FIVE_MINUTES: Self = Self { seconds: 300 };
    /// One hour.
    pub const HOUR: Self = Self { seconds: 3_600 };
    /// One day.
    pub const DAY: Self = Self { seconds: 86_400 };

    /// Creates an interval from a whole number of seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `seconds` is zero.
    pub fn from_secs(seconds: u32) -> Result<Self> {
        if seconds == 0 {
            return Err(Error::InvalidInput(
                "interval must be at least one second".to_string(),
            ));
        }
        Ok(Self { seconds })
    }

    /// Parses an interval string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty, zero, overflowing or
    /// unit-less string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidInput(format!("interval '{s}' has no unit")))?;
        let (count, unit) = s.split_at(split);
        let count: u32 = count
            .parse()
            .map_err(|_| Error::InvalidInput(format!("interval '{s}' has no valid count")))?;
        let multiplier: u32 = match unit.to_ascii_lowercase().as_str() {
            "s" => 1,
            "m" | "min" => 60,
            "h" => 3_600,
            "d" => 86_400,
            other => {
                return Err(Error::InvalidInput(format!(
                    "interval unit '{other}' is not one of s, m, min, h, d"
                )));
            },
        };
        let seconds = count
            .checked_mul(multiplier)
            .ok_or_else(|| Error::InvalidInput(format!("interval '{s}' is too large")))?;
        Self::from_secs(seconds)
    }

    /// Returns the width in seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u32 {
        self.seconds
    }

    /// Returns the width as a [`Duration`].
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds as u64)
    }

    /// Returns the start of the bucket containing `ts`.
    #[must_use]
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = i64::from(self.seconds);
        let start = ts.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{s}s")
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Interval {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

/// Summary statistics for one metric type within one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    /// Bucket start (inclusive).
    pub time_bucket: DateTime<Utc>,
    /// Metric key.
    pub metric_type: String,
    /// Arithmetic mean, unrounded.
    pub avg_value: f64,
    /// Smallest sample.
    pub min_value: f64,
    /// Largest sample.
    pub max_value: f64,
    /// Number of samples in the bucket; never zero.
    pub sample_count: u64,
    /// Unit of the first sample seen.
    pub unit: Option<String>,
}

struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    unit: Option<String>,
}

/// Groups samples into `(bucket, metric_type)` cells and summarizes each.
///
/// Output is ordered by bucket start, then metric type. Input order does
/// not matter.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(points: &[MetricPoint], interval: Interval) -> Vec<AggregateBucket> {
    let mut cells: BTreeMap<(DateTime<Utc>, &str), Accumulator> = BTreeMap::new();

    for point in points {
        let bucket = interval.bucket_start(point.timestamp);
        cells
            .entry((bucket, point.metric_type.as_str()))
            .and_modify(|acc| {
                acc.sum += point.value;
                acc.min = acc.min.min(point.value);
                acc.max = acc.max.max(point.value);
                acc.count += 1;
            })
            .or_insert_with(|| Accumulator {
                sum: point.value,
                min: point.value,
                max: point.value,
                count: 1,
                unit: point.unit.clone(),
            });
    }

    cells
        .into_iter()
        .map(|((time_bucket, metric_type), acc)| AggregateBucket {
            time_bucket,
            metric_type: metric_type.to_string(),
            avg_value: acc.sum / acc.count as f64,
            min_value: acc.min,
            max_value: acc.max,
            sample_count: acc.count,
            unit: acc.unit,
        })
        .collect()
}
