//! Cross-sensor temporal cluster detector.
//!
//! Model: one graph node per anomaly, an undirected edge between any two
//! anomalies whose timestamps differ by at most `time_window`. Connected
//! components are candidate clusters. On a time line those components are
//! exactly the groups produced by chaining sorted timestamps whose
//! consecutive gap is within the window, which is how both the batch and
//! the online variant compute them.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::Severity;
use crate::config::ClusterConfig;

use super::anomaly::AnomalyRecord;

/// Reference period for the co-occurrence estimate (one hour).
const CO_OCCURRENCE_REFERENCE_SECS: f64 = 3600.0;

/// A single anomaly admitted to clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub timestamp: f64,
    pub source: String,
    pub parameter: String,
    pub value: f64,
    pub mean: f64,
    pub std: f64,
    pub z_score: f64,
    pub severity: Severity,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AnomalyEvent {
    pub fn from_record(record: &AnomalyRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            source: record.source.clone(),
            parameter: record.parameter.clone(),
            value: record.value,
            mean: record.mean,
            std: record.std,
            z_score: record.z_score,
            severity: severity_for_z(record.z_score.abs(), record.threshold),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Map deviation magnitude to a severity band relative to the threshold.
pub fn severity_for_z(z_abs: f64, threshold: f64) -> Severity {
    if z_abs > threshold * 2.0 {
        Severity::Critical
    } else if z_abs > threshold * 1.25 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// A temporally-correlated group of anomalies. Immutable once finalized.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    /// 1-5, deterministic in (unique_sources, anomaly_count).
    pub level: u8,
    pub anomalies: Vec<AnomalyEvent>,
    pub anomaly_count: usize,
    pub unique_sources: usize,
    /// Deduplicated, order of first appearance.
    pub sources: Vec<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub time_span: f64,
    pub is_multi_source: bool,
    /// How likely the grouping is under independence. Informational only,
    /// never used to suppress a cluster.
    pub co_occurrence_probability: f64,
}

/// A cluster plus its position in a ranked set.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCluster {
    pub rank: usize,
    pub score: f64,
    #[serde(flatten)]
    pub cluster: Cluster,
}

/// Deterministic, monotone level policy: base level tracks source
/// diversity (capped at 4 until five distinct sources), bumped by one
/// for unusually large clusters.
pub fn level_for(unique_sources: usize, anomaly_count: usize) -> u8 {
    let base = match unique_sources {
        0 | 1 => 1u8,
        2 => 2,
        3 => 3,
        4 => 4,
        _ => 5,
    };
    if anomaly_count >= 10 {
        (base + 1).min(5)
    } else {
        base
    }
}

pub struct ClusterDetector {
    time_window: f64,
    min_cluster_size: usize,
    multi_source_threshold: usize,
    /// Open component for the incremental variant.
    open: Mutex<Vec<AnomalyEvent>>,
}

impl ClusterDetector {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            time_window: config.time_window_secs,
            min_cluster_size: config.min_cluster_size.max(1),
            multi_source_threshold: config.multi_source_threshold,
            open: Mutex::new(Vec::new()),
        }
    }

    fn lock_open(&self) -> MutexGuard<'_, Vec<AnomalyEvent>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn time_window(&self) -> f64 {
        self.time_window
    }

    /// Batch variant: connected components over a full anomaly table.
    pub fn find_clusters(&self, anomalies: &[AnomalyEvent]) -> Vec<Cluster> {
        if anomalies.is_empty() {
            return Vec::new();
        }

        let mut sorted: Vec<&AnomalyEvent> = anomalies.iter().collect();
        sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let mut clusters = Vec::new();
        let mut component: Vec<AnomalyEvent> = vec![sorted[0].clone()];
        for event in &sorted[1..] {
            let last_ts = component
                .last()
                .map(|e| e.timestamp)
                .unwrap_or(event.timestamp);
            if event.timestamp - last_ts <= self.time_window {
                component.push((*event).clone());
            } else {
                if component.len() >= self.min_cluster_size {
                    clusters.push(self.build_cluster(std::mem::take(&mut component)));
                }
                component = vec![(*event).clone()];
            }
        }
        if component.len() >= self.min_cluster_size {
            clusters.push(self.build_cluster(component));
        }
        clusters
    }

    /// Incremental variant: feed anomalies as they arrive. Returns the
    /// previous cluster when the new arrival closes it (gap > window).
    pub fn observe(&self, event: AnomalyEvent) -> Option<Cluster> {
        let mut open = self.lock_open();
        let finalized = match open.last() {
            Some(last) if (event.timestamp - last.timestamp).abs() <= self.time_window => None,
            Some(_) => {
                let component = std::mem::take(&mut *open);
                if component.len() >= self.min_cluster_size {
                    Some(self.build_cluster(component))
                } else {
                    None
                }
            }
            None => None,
        };
        open.push(event);
        if let Some(cluster) = &finalized {
            debug!(
                level = cluster.level,
                sources = cluster.unique_sources,
                count = cluster.anomaly_count,
                "cluster finalized"
            );
        }
        finalized
    }

    /// Close and return the open component, if it qualifies.
    pub fn flush(&self) -> Option<Cluster> {
        let component = std::mem::take(&mut *self.lock_open());
        if component.len() >= self.min_cluster_size {
            Some(self.build_cluster(component))
        } else {
            None
        }
    }

    /// Close the open component only once it can no longer grow: any
    /// future anomaly would sit further than the window from its last
    /// member. Safe to call on a timer.
    pub fn flush_stale(&self, now: f64) -> Option<Cluster> {
        let mut open = self.lock_open();
        match open.last() {
            Some(last) if now - last.timestamp > self.time_window => {
                let component = std::mem::take(&mut *open);
                if component.len() >= self.min_cluster_size {
                    Some(self.build_cluster(component))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Order by (unique_sources desc, anomaly_count desc, time_span asc),
    /// assigning 1-based ranks and a composite score.
    pub fn rank_clusters(&self, mut clusters: Vec<Cluster>) -> Vec<RankedCluster> {
        clusters.sort_by(|a, b| {
            b.unique_sources
                .cmp(&a.unique_sources)
                .then(b.anomaly_count.cmp(&a.anomaly_count))
                .then(a.time_span.total_cmp(&b.time_span))
        });
        clusters
            .into_iter()
            .enumerate()
            .map(|(i, cluster)| {
                let score = cluster.unique_sources as f64 * 100.0
                    + cluster.anomaly_count as f64 * 10.0
                    + 1.0 / (1.0 + cluster.time_span);
                RankedCluster {
                    rank: i + 1,
                    score,
                    cluster,
                }
            })
            .collect()
    }

    /// Keep only clusters spanning at least the multi-source threshold.
    pub fn multi_source_clusters(&self, clusters: &[Cluster]) -> Vec<Cluster> {
        clusters
            .iter()
            .filter(|c| c.is_multi_source)
            .cloned()
            .collect()
    }

    fn build_cluster(&self, anomalies: Vec<AnomalyEvent>) -> Cluster {
        let mut sources: Vec<String> = Vec::new();
        for event in &anomalies {
            if !sources.contains(&event.source) {
                sources.push(event.source.clone());
            }
        }
        let start_time = anomalies
            .iter()
            .map(|e| e.timestamp)
            .fold(f64::INFINITY, f64::min);
        let end_time = anomalies
            .iter()
            .map(|e| e.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        let time_span = end_time - start_time;
        let anomaly_count = anomalies.len();
        let unique_sources = sources.len();

        Cluster {
            level: level_for(unique_sources, anomaly_count),
            anomaly_count,
            unique_sources,
            is_multi_source: unique_sources >= self.multi_source_threshold,
            co_occurrence_probability: co_occurrence_probability(unique_sources, time_span),
            sources,
            start_time,
            end_time,
            time_span,
            anomalies,
        }
    }
}

/// Probability that `unique_sources` independent sensors would land in a
/// span this tight by chance, assuming uniform arrival over the reference
/// period. Smaller means more surprising.
fn co_occurrence_probability(unique_sources: usize, time_span: f64) -> f64 {
    if unique_sources <= 1 {
        return 1.0;
    }
    let per_source = (time_span.max(1.0) / CO_OCCURRENCE_REFERENCE_SECS).min(1.0);
    per_source.powi(unique_sources as i32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: f64, source: &str) -> AnomalyEvent {
        AnomalyEvent {
            timestamp,
            source: source.to_string(),
            parameter: "value".to_string(),
            value: 1.0,
            mean: 0.0,
            std: 1.0,
            z_score: 5.0,
            severity: Severity::Warning,
            metadata: serde_json::Value::Null,
        }
    }

    fn detector(time_window: f64, min_cluster_size: usize) -> ClusterDetector {
        ClusterDetector::new(&ClusterConfig {
            time_window_secs: time_window,
            min_cluster_size,
            multi_source_threshold: 3,
        })
    }

    fn sample_anomalies() -> Vec<AnomalyEvent> {
        let fixtures = [
            (0.0, "a"),
            (1.0, "b"),
            (2.0, "c"),
            (100.0, "a"),
            (101.0, "b"),
            (102.0, "c"),
            (103.0, "d"),
            (200.0, "a"),
        ];
        fixtures.iter().map(|(t, s)| event(*t, s)).collect()
    }

    #[test]
    fn test_finds_two_clusters() {
        let det = detector(3.0, 2);
        let clusters = det.find_clusters(&sample_anomalies());
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].anomaly_count, 3);
        assert_eq!(clusters[1].anomaly_count, 4);
        assert_eq!(clusters[1].unique_sources, 4);
    }

    #[test]
    fn test_cluster_fields() {
        let det = detector(3.0, 2);
        let clusters = det.find_clusters(&sample_anomalies());
        let second = &clusters[1];
        assert_eq!(second.start_time, 100.0);
        assert_eq!(second.end_time, 103.0);
        assert_eq!(second.time_span, 3.0);
        assert_eq!(second.sources, vec!["a", "b", "c", "d"]);
        assert!(second.is_multi_source);
        assert!(!clusters[0].is_multi_source || clusters[0].unique_sources >= 3);
    }

    #[test]
    fn test_widely_spaced_anomalies_never_merge() {
        let det = detector(2.0, 2);
        let anomalies: Vec<AnomalyEvent> =
            (0..20).map(|i| event(i as f64 * 100.0, "a")).collect();
        assert!(det.find_clusters(&anomalies).is_empty());
    }

    #[test]
    fn test_single_anomaly_trivial_cluster() {
        let det = detector(2.0, 1);
        let clusters = det.find_clusters(&[event(5.0, "a")]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].anomaly_count, 1);
        assert_eq!(clusters[0].level, 1);
        assert_eq!(clusters[0].time_span, 0.0);
    }

    #[test]
    fn test_empty_input() {
        let det = detector(3.0, 2);
        assert!(det.find_clusters(&[]).is_empty());
    }

    #[test]
    fn test_multi_source_flag_tracks_threshold() {
        let det = detector(5.0, 2);
        let clusters = det.find_clusters(&sample_anomalies());
        for cluster in clusters {
            assert_eq!(cluster.is_multi_source, cluster.unique_sources >= 3);
        }
    }

    #[test]
    fn test_online_matches_batch() {
        let det = detector(3.0, 2);
        let mut finalized = Vec::new();
        for anomaly in sample_anomalies() {
            if let Some(cluster) = det.observe(anomaly) {
                finalized.push(cluster);
            }
        }
        if let Some(cluster) = det.flush() {
            finalized.push(cluster);
        }
        // Trailing singleton at t=200 does not qualify.
        assert_eq!(finalized.len(), 2);
        assert_eq!(finalized[0].anomaly_count, 3);
        assert_eq!(finalized[1].anomaly_count, 4);
    }

    #[test]
    fn test_flush_stale_waits_for_the_window() {
        let det = detector(3.0, 2);
        det.observe(event(0.0, "a"));
        det.observe(event(1.0, "b"));

        // A future anomaly at t=3.5 could still join.
        assert!(det.flush_stale(3.5).is_none());

        let cluster = det.flush_stale(10.0).expect("stale component closed");
        assert_eq!(cluster.anomaly_count, 2);
        assert!(det.flush().is_none());
    }

    #[test]
    fn test_flush_stale_discards_undersized_component() {
        let det = detector(3.0, 2);
        det.observe(event(0.0, "a"));
        assert!(det.flush_stale(10.0).is_none());
        assert!(det.flush().is_none());
    }

    #[test]
    fn test_level_is_monotone() {
        for sources in 1..=6 {
            for count in sources..=12 {
                let level = level_for(sources, count);
                assert!((1..=5).contains(&level));
                assert!(level >= level_for(sources.saturating_sub(1).max(1), count.saturating_sub(1).max(1)));
            }
        }
        assert_eq!(level_for(1, 2), 1);
        assert_eq!(level_for(3, 5), 3);
        assert_eq!(level_for(5, 5), 5);
        assert_eq!(level_for(4, 12), 5);
    }

    #[test]
    fn test_ranking_order() {
        let det = detector(3.0, 1);
        let clusters = det.find_clusters(&sample_anomalies());
        let ranked = det.rank_clusters(clusters);
        for (i, entry) in ranked.iter().enumerate() {
            assert_eq!(entry.rank, i + 1);
        }
        // Four-source cluster outranks the rest.
        assert_eq!(ranked[0].cluster.unique_sources, 4);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_co_occurrence_probability_bounds() {
        let det = detector(3.0, 2);
        for cluster in det.find_clusters(&sample_anomalies()) {
            assert!((0.0..=1.0).contains(&cluster.co_occurrence_probability));
        }
        // Tight multi-source grouping is more surprising than a loose one.
        assert!(
            co_occurrence_probability(4, 3.0) < co_occurrence_probability(4, 1800.0)
        );
    }

    #[test]
    fn test_severity_for_z_bands() {
        assert_eq!(severity_for_z(4.1, 4.0), Severity::Info);
        assert_eq!(severity_for_z(5.5, 4.0), Severity::Warning);
        assert_eq!(severity_for_z(9.0, 4.0), Severity::Critical);
    }
}
