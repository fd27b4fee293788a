//! Injected configuration for the watcher core.
//!
//! The core never reads files itself: callers build a [`WatchConfig`]
//! (from CLI flags, a config file, or defaults) and pass it in.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub detector: DetectorConfig,
    pub cluster: ClusterConfig,
    pub patterns: PatternConfig,
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples kept per (source, parameter) baseline window.
    pub window_size: usize,
    /// Absolute z-score above which a value is flagged.
    pub threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            threshold: 4.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Two anomalies within this many seconds are considered connected.
    pub time_window_secs: f64,
    pub min_cluster_size: usize,
    /// Unique-source count at which a cluster counts as multi-source.
    pub multi_source_threshold: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            time_window_secs: 300.0,
            min_cluster_size: 2,
            multi_source_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// How far back a condition may still be matched to a later event.
    pub lookback_hours: f64,
    /// Capacity of the recent-conditions buffer.
    pub recent_capacity: usize,
    /// Minimum observations before a probability is surfaced.
    pub min_observations: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 72.0,
            recent_capacity: 5000,
            min_observations: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber failed-delivery buffer capacity.
    pub max_buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.detector.window_size, 100);
        assert_eq!(cfg.detector.threshold, 4.0);
        assert_eq!(cfg.cluster.min_cluster_size, 2);
        assert_eq!(cfg.cluster.multi_source_threshold, 3);
        assert_eq!(cfg.patterns.lookback_hours, 72.0);
        assert_eq!(cfg.bus.max_buffer_size, 1000);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let cfg: WatchConfig =
            serde_json::from_str(r#"{"detector": {"threshold": 3.5}}"#).unwrap();
        assert_eq!(cfg.detector.threshold, 3.5);
        assert_eq!(cfg.detector.window_size, 100);
        assert_eq!(cfg.scheduler.max_concurrent, 4);
    }
}
