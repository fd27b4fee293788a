//! End-to-end wiring: sensor readings in, bus events out.
//!
//! One [`Watcher`] owns the detector, the cluster detector and the
//! pattern tracker. Every stage's output is published on the shared
//! [`EventBus`] so observers can tap any point of the pipeline.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::bus::{Event, EventBus, EventType, Severity};
use crate::config::WatchConfig;
use crate::detect::{AnomalyDetector, AnomalyEvent, Cluster, ClusterDetector};
use crate::patterns::{
    Condition, EventCategory, EventProbability, EventSeverity, PatternEvent, PatternTracker,
};

/// One timestamped payload from a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    pub source: String,
    pub data: Value,
}

/// What a single [`Watcher::ingest`] call produced.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub anomalies: usize,
    pub clusters: usize,
    pub events: Vec<PatternEvent>,
}

pub struct Watcher {
    bus: Arc<EventBus>,
    detector: AnomalyDetector,
    clusters: ClusterDetector,
    tracker: PatternTracker,
}

impl Watcher {
    pub fn new(config: &WatchConfig, bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            detector: AnomalyDetector::new(&config.detector),
            clusters: ClusterDetector::new(&config.cluster),
            tracker: PatternTracker::new(&config.patterns),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn tracker(&self) -> &PatternTracker {
        &self.tracker
    }

    /// Run one reading through the whole pipeline.
    ///
    /// Numeric fields are flattened to dotted parameter names and scored
    /// individually; flagged values feed the cluster detector, finalized
    /// clusters become recorded conditions, and the raw payload is checked
    /// against the event rules.
    pub fn ingest(&self, reading: &SensorReading) -> Result<IngestOutcome> {
        let mut outcome = IngestOutcome::default();

        self.bus.publish(
            &Event::new(
                reading.source.clone(),
                EventType::Data,
                reading.data.clone(),
            )
            .with_severity(Severity::Debug),
        );

        let mut params = Vec::new();
        flatten_numeric("", &reading.data, &mut params);
        for (parameter, value) in params {
            let Some(record) = self.detector.process(&reading.source, &parameter, value) else {
                continue;
            };
            outcome.anomalies += 1;

            let mut anomaly = AnomalyEvent::from_record(&record);
            // Cluster on sensor time, not wall-clock arrival time.
            anomaly.timestamp = reading.timestamp;

            self.bus.publish(
                &Event::new(
                    reading.source.clone(),
                    EventType::Anomaly,
                    serde_json::to_value(&anomaly)?,
                )
                .with_severity(anomaly.severity),
            );

            if let Some(cluster) = self.clusters.observe(anomaly) {
                self.handle_cluster(cluster)?;
                outcome.clusters += 1;
            }
        }

        let mut payload = reading.data.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("source".to_string(), Value::String(reading.source.clone()));
        }
        for event in self.tracker.check_events(&payload, reading.timestamp) {
            self.bus.publish(
                &Event::new(
                    reading.source.clone(),
                    EventType::Pattern,
                    serde_json::to_value(&event)?,
                )
                .with_severity(bus_severity(event.severity)),
            );
            outcome.events.push(event);
        }

        Ok(outcome)
    }

    /// Unconditionally close the open cluster component, if any. Used at
    /// shutdown so nothing in flight is lost.
    pub fn flush_clusters(&self) -> Result<bool> {
        match self.clusters.flush() {
            Some(cluster) => {
                self.handle_cluster(cluster)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close the open cluster once it is out of reach of new anomalies.
    /// Driven by the periodic flush task, so a quiet spell finalizes a
    /// cluster without waiting for the next anomaly.
    pub fn flush_stale_clusters(&self, now: f64) -> Result<bool> {
        match self.clusters.flush_stale(now) {
            Some(cluster) => {
                self.handle_cluster(cluster)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Probability estimates for the given condition.
    pub fn probabilities(
        &self,
        condition: &Condition,
        category: Option<EventCategory>,
    ) -> Vec<EventProbability> {
        self.tracker.get_probabilities(condition, category)
    }

    fn handle_cluster(&self, cluster: Cluster) -> Result<()> {
        info!(
            level = cluster.level,
            sources = cluster.unique_sources,
            count = cluster.anomaly_count,
            span = cluster.time_span,
            "cluster detected"
        );

        let condition = condition_from_cluster(&cluster, self.detector.threshold());
        self.tracker.record_condition(condition);

        let severity = match cluster.level {
            4 | 5 => Severity::Critical,
            3 => Severity::Warning,
            _ => Severity::Info,
        };
        self.bus.publish(
            &Event::new("watcher", EventType::Cluster, serde_json::to_value(&cluster)?)
                .with_severity(severity),
        );
        Ok(())
    }
}

/// Derive a trackable condition from a finalized cluster. The composite
/// index scales mean deviation so that values right at the threshold land
/// at 50 of 100.
fn condition_from_cluster(cluster: &Cluster, threshold: f64) -> Condition {
    let mean_abs_z = if cluster.anomalies.is_empty() {
        0.0
    } else {
        cluster.anomalies.iter().map(|a| a.z_score.abs()).sum::<f64>()
            / cluster.anomalies.len() as f64
    };
    let baseline_ratio = mean_abs_z / threshold;
    let anomaly_index = (baseline_ratio * 50.0).min(100.0);
    Condition::new(
        cluster.end_time,
        cluster.level,
        cluster.sources.clone(),
        anomaly_index,
        baseline_ratio,
    )
}

fn bus_severity(severity: EventSeverity) -> Severity {
    match severity {
        EventSeverity::Low => Severity::Debug,
        EventSeverity::Medium => Severity::Info,
        EventSeverity::High => Severity::Warning,
        EventSeverity::Critical => Severity::Critical,
    }
}

/// Collect every numeric leaf of a payload under a dotted path. The
/// top-level `timestamp` field is metadata, not a measurement.
fn flatten_numeric(prefix: &str, value: &Value, out: &mut Vec<(String, f64)>) {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.push((prefix.to_string(), v));
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                if prefix.is_empty() && key == "timestamp" {
                    continue;
                }
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_numeric(&path, child, out);
            }
        }
        _ => {}
    }
}
