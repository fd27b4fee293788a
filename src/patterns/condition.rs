//! A cluster snapshot used as the left-hand side of a learned pattern.

use chrono::{DateTime, Datelike, Timelike};
use serde::{Deserialize, Serialize};

/// A system condition at a point in time. Temporal features are derived
/// from the timestamp (UTC) at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub timestamp: f64,
    /// Cluster level 1-5.
    pub level: u8,
    /// Which sensors were involved.
    pub sources: Vec<String>,
    /// 0-100 composite deviation index.
    pub anomaly_index: f64,
    /// How far above baseline the cluster sat.
    pub baseline_ratio: f64,
    pub hour_of_day: u32,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u32,
    pub is_weekend: bool,
    pub month: u32,
}

impl Condition {
    pub fn new(
        timestamp: f64,
        level: u8,
        sources: Vec<String>,
        anomaly_index: f64,
        baseline_ratio: f64,
    ) -> Self {
        let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_default();
        let day_of_week = dt.weekday().num_days_from_monday();
        Self {
            timestamp,
            level,
            sources,
            anomaly_index,
            baseline_ratio,
            hour_of_day: dt.hour(),
            day_of_week,
            is_weekend: day_of_week >= 5,
            month: dt.month(),
        }
    }

    /// Base pattern key: `L{level}_{sorted sources joined by '_'}`.
    pub fn key(&self) -> String {
        let mut sorted = self.sources.clone();
        sorted.sort();
        format!("L{}_{}", self.level, sorted.join("_"))
    }

    /// Pattern key extended with time-of-day bucket and weekend flag.
    pub fn temporal_key(&self) -> String {
        let weekend = if self.is_weekend { "weekend" } else { "weekday" };
        format!("{}_{}_{}", self.key(), self.time_bucket(), weekend)
    }

    pub fn time_bucket(&self) -> &'static str {
        match self.hour_of_day {
            0..=5 => "night",
            6..=11 => "morning",
            12..=17 => "afternoon",
            _ => "evening",
        }
    }

    /// Human-readable bucket for reporting.
    pub fn time_bucket_label(&self) -> &'static str {
        match self.hour_of_day {
            0..=5 => "night (00-06 UTC)",
            6..=11 => "morning (06-12 UTC)",
            12..=17 => "afternoon (12-18 UTC)",
            _ => "evening (18-24 UTC)",
        }
    }
}
