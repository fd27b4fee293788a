//! Condition → event pattern statistics.
//!
//! Every probability surfaced here is a measured conditional frequency:
//! `conditions followed by the event / conditions observed`. A condition
//! counts at most once per event type, so a burst of identical events
//! cannot inflate the numerator past the denominator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::condition::Condition;
use super::events::{
    rule_for, EventCategory, EventSeverity, PatternEvent, PriceHistory, EVENT_RULES,
};
use super::geo::dominant_region;
use super::PatternError;
use crate::config::PatternConfig;

/// Temporal patterns need this many observations before they are
/// preferred over the base pattern.
const TEMPORAL_MIN_OBS: u64 = 50;
/// Estimates with less average lead time than this describe the present,
/// not the future, and are suppressed.
const MIN_LEAD_HOURS: f64 = 0.5;
/// Earthquake estimates with a wider min..max window than this are too
/// vague to surface.
const MAX_QUAKE_WINDOW_HOURS: f64 = 12.0;
/// Cap on stored event locations per pattern.
const MAX_EVENT_LOCATIONS: usize = 1000;

/// JSON has no infinity, so an unset minimum serializes as `null`.
mod none_as_infinity {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, ser: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            ser.serialize_some(value)
        } else {
            ser.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(de)?.unwrap_or(f64::INFINITY))
    }
}

/// Running statistics for one `condition key → event type` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub condition_key: String,
    pub event_type: String,
    /// How many times the condition occurred.
    pub condition_count: u64,
    /// How many of those occurrences were followed by the event.
    pub event_after_count: u64,
    pub avg_time_to_event: f64,
    #[serde(with = "none_as_infinity")]
    pub min_time_to_event: f64,
    pub max_time_to_event: f64,
    /// Last probability we reported for this pattern.
    pub predicted_probability: f64,
    /// What the observations actually show.
    pub actual_probability: f64,
    pub brier_score: f64,
    /// (lat, lon) of matched geographic events, most recent last.
    pub event_locations: Vec<(f64, f64)>,
}

impl Pattern {
    pub fn new(condition_key: &str, event_type: &str) -> Self {
        Self {
            condition_key: condition_key.to_string(),
            event_type: event_type.to_string(),
            condition_count: 0,
            event_after_count: 0,
            avg_time_to_event: 0.0,
            min_time_to_event: f64::INFINITY,
            max_time_to_event: 0.0,
            predicted_probability: 0.0,
            actual_probability: 0.0,
            brier_score: 0.0,
            event_locations: Vec::new(),
        }
    }

    pub fn update_probability(&mut self) {
        self.actual_probability = if self.condition_count > 0 {
            (self.event_after_count as f64 / self.condition_count as f64).min(1.0)
        } else {
            0.0
        };
    }

    pub fn update_brier_score(&mut self) {
        if self.condition_count > 0 {
            let err = self.predicted_probability - self.actual_probability;
            self.brier_score = err * err;
        }
    }
}

/// A probability estimate for one event type, given a condition.
#[derive(Debug, Clone, Serialize)]
pub struct EventProbability {
    pub event_type: String,
    pub probability: f64,
    pub avg_time_hours: f64,
    pub min_time_hours: Option<f64>,
    pub max_time_hours: Option<f64>,
    pub observations: u64,
    pub occurrences: u64,
    pub description: &'static str,
    pub severity: EventSeverity,
    pub category: EventCategory,
    /// True when the estimate came from a time-of-day refined pattern.
    pub temporal_pattern: bool,
    pub time_bucket: Option<&'static str>,
    pub is_weekend: Option<bool>,
    /// Dominant geographic region for earthquake patterns.
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationStats {
    pub total_patterns: usize,
    pub avg_brier_score: f64,
    pub well_calibrated_percent: f64,
}

/// A condition awaiting future events, with the event types it has
/// already been credited for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedCondition {
    pub condition: Condition,
    #[serde(default)]
    pub matched_events: HashSet<String>,
}

/// Persistent state: everything needed to survive a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub patterns: HashMap<String, HashMap<String, Pattern>>,
    pub recent_conditions: Vec<RecordedCondition>,
}

impl TrackerSnapshot {
    pub fn from_json(json: &str) -> Result<Self, PatternError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, PatternError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    recent: VecDeque<RecordedCondition>,
    patterns: HashMap<String, HashMap<String, Pattern>>,
    prices: PriceHistory,
}

/// Tracks which external events tend to follow which cluster conditions.
#[derive(Debug)]
pub struct PatternTracker {
    lookback_secs: f64,
    recent_capacity: usize,
    min_observations: u64,
    state: Mutex<TrackerState>,
}

impl PatternTracker {
    pub fn new(cfg: &PatternConfig) -> Self {
        Self {
            lookback_secs: cfg.lookback_hours * 3600.0,
            recent_capacity: cfg.recent_capacity.max(1),
            min_observations: cfg.min_observations,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new condition and open pattern rows for every event type,
    /// under both the base and the time-of-day refined key.
    pub fn record_condition(&self, condition: Condition) {
        let mut state = self.lock();
        let base_key = condition.key();
        let temporal_key = condition.temporal_key();

        for key in [base_key.as_str(), temporal_key.as_str()] {
            let group = state.patterns.entry(key.to_string()).or_default();
            for rule in EVENT_RULES {
                let pattern = group
                    .entry(rule.event_type.to_string())
                    .or_insert_with(|| Pattern::new(key, rule.event_type));
                pattern.condition_count += 1;
                pattern.update_probability();
            }
        }

        if state.recent.len() == self.recent_capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(RecordedCondition {
            condition,
            matched_events: HashSet::new(),
        });
        debug!(key = %base_key, temporal = %temporal_key, "recorded condition");
    }

    /// Evaluate every event rule against a sensor payload and credit any
    /// fired events to the recent conditions that preceded them.
    pub fn check_events(&self, payload: &serde_json::Value, now: f64) -> Vec<PatternEvent> {
        let mut state = self.lock();
        state.prices.record_from_payload(payload, now);

        let mut events = Vec::new();
        for rule in EVENT_RULES {
            if !rule.check(payload, now, &state.prices) {
                continue;
            }
            let event = PatternEvent {
                timestamp: now,
                event_type: rule.event_type.to_string(),
                severity: rule.severity,
                metadata: serde_json::json!({ "description": rule.description }),
                location: rule.location_from(payload),
            };
            info!(event_type = rule.event_type, "event detected");
            Self::match_event(&mut state, &event, self.lookback_secs);
            events.push(event);
        }
        events
    }

    /// Credit an event to every unmatched condition in the lookback
    /// window. A condition counts once per event type no matter how many
    /// times the event repeats.
    fn match_event(state: &mut TrackerState, event: &PatternEvent, lookback_secs: f64) {
        let TrackerState {
            recent, patterns, ..
        } = state;

        for item in recent.iter_mut() {
            let dt = event.timestamp - item.condition.timestamp;
            if dt <= 0.0 || dt >= lookback_secs {
                continue;
            }
            if item.matched_events.contains(&event.event_type) {
                continue;
            }

            for key in [item.condition.key(), item.condition.temporal_key()] {
                let Some(pattern) = patterns
                    .get_mut(&key)
                    .and_then(|group| group.get_mut(&event.event_type))
                else {
                    continue;
                };
                pattern.event_after_count += 1;
                if let Some(loc) = event.location {
                    pattern.event_locations.push(loc);
                    if pattern.event_locations.len() > MAX_EVENT_LOCATIONS {
                        let excess = pattern.event_locations.len() - MAX_EVENT_LOCATIONS;
                        pattern.event_locations.drain(..excess);
                    }
                }
                if dt < pattern.min_time_to_event {
                    pattern.min_time_to_event = dt;
                }
                if dt > pattern.max_time_to_event {
                    pattern.max_time_to_event = dt;
                }
                let n = pattern.event_after_count as f64;
                pattern.avg_time_to_event = (pattern.avg_time_to_event * (n - 1.0) + dt) / n;
                pattern.update_probability();
            }

            item.matched_events.insert(event.event_type.clone());
        }
    }

    /// Probability estimates for a condition, most probable first.
    ///
    /// Time-of-day refined patterns are preferred once they have enough
    /// observations of their own. Internal-only event types, estimates
    /// with no meaningful lead time, and overly wide earthquake windows
    /// are suppressed.
    pub fn get_probabilities(
        &self,
        condition: &Condition,
        category_filter: Option<EventCategory>,
    ) -> Vec<EventProbability> {
        let mut state = self.lock();
        let base_key = condition.key();
        let temporal_key = condition.temporal_key();

        let event_types: Vec<String> = match state.patterns.get(&base_key) {
            Some(group) => group.keys().cloned().collect(),
            None => return Vec::new(),
        };

        let mut results = Vec::new();
        for event_type in event_types {
            let Some(rule) = rule_for(&event_type) else {
                continue;
            };
            // Internal statistics only.
            if rule.category == EventCategory::Other {
                continue;
            }
            // M5.0+ quakes fire too often to be a useful signal.
            if event_type == "earthquake_moderate" {
                continue;
            }
            if let Some(cat) = category_filter {
                if rule.category != cat {
                    continue;
                }
            }

            let use_temporal = state
                .patterns
                .get(&temporal_key)
                .and_then(|group| group.get(&event_type))
                .is_some_and(|p| p.condition_count >= TEMPORAL_MIN_OBS);
            let key = if use_temporal { &temporal_key } else { &base_key };
            let Some(pattern) = state
                .patterns
                .get_mut(key)
                .and_then(|group| group.get_mut(&event_type))
            else {
                continue;
            };

            if pattern.condition_count < self.min_observations {
                continue;
            }
            if pattern.actual_probability <= 0.0 {
                continue;
            }
            let avg_hours = pattern.avg_time_to_event / 3600.0;
            if avg_hours < MIN_LEAD_HOURS {
                continue;
            }
            let min_hours = pattern
                .min_time_to_event
                .is_finite()
                .then(|| pattern.min_time_to_event / 3600.0);
            let max_hours =
                (pattern.max_time_to_event > 0.0).then(|| pattern.max_time_to_event / 3600.0);
            if rule.category == EventCategory::Earthquake {
                if let (Some(min_h), Some(max_h)) = (min_hours, max_hours) {
                    if max_h - min_h >= MAX_QUAKE_WINDOW_HOURS {
                        continue;
                    }
                }
            }

            // Surfacing the estimate is the prediction we later score.
            pattern.predicted_probability = pattern.actual_probability;

            let region = (rule.category == EventCategory::Earthquake)
                .then(|| dominant_region(&pattern.event_locations))
                .flatten();

            results.push(EventProbability {
                event_type: event_type.clone(),
                probability: pattern.actual_probability,
                avg_time_hours: avg_hours,
                min_time_hours: min_hours,
                max_time_hours: max_hours,
                observations: pattern.condition_count,
                occurrences: pattern.event_after_count,
                description: rule.description,
                severity: rule.severity,
                category: rule.category,
                temporal_pattern: use_temporal,
                time_bucket: use_temporal.then(|| condition.time_bucket_label()),
                is_weekend: use_temporal.then_some(condition.is_weekend),
                region,
            });
        }

        results.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.event_type.cmp(&b.event_type))
        });
        results
    }

    /// Brier-score calibration across all patterns with enough data.
    pub fn calibration_stats(&self) -> CalibrationStats {
        let mut state = self.lock();
        let mut total = 0usize;
        let mut brier_sum = 0.0;
        let mut well_calibrated = 0usize;

        for group in state.patterns.values_mut() {
            for pattern in group.values_mut() {
                if pattern.condition_count < 5 {
                    continue;
                }
                pattern.update_brier_score();
                total += 1;
                brier_sum += pattern.brier_score;
                if pattern.brier_score < 0.1 {
                    well_calibrated += 1;
                }
            }
        }

        CalibrationStats {
            total_patterns: total,
            avg_brier_score: if total > 0 { brier_sum / total as f64 } else { 0.0 },
            well_calibrated_percent: if total > 0 {
                well_calibrated as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.lock();
        TrackerSnapshot {
            patterns: state.patterns.clone(),
            recent_conditions: state.recent.iter().cloned().collect(),
        }
    }

    /// Replace in-memory state from a snapshot. Conditions outside the
    /// lookback window are dropped; price history is rebuilt live.
    pub fn restore(&self, snapshot: TrackerSnapshot, now: f64) {
        let mut state = self.lock();
        state.patterns = snapshot.patterns;
        let mut recent: VecDeque<RecordedCondition> = snapshot
            .recent_conditions
            .into_iter()
            .filter(|item| now - item.condition.timestamp < self.lookback_secs)
            .collect();
        // When over capacity, keep the newest conditions.
        while recent.len() > self.recent_capacity {
            recent.pop_front();
        }
        state.recent = recent;
        info!(
            pattern_groups = state.patterns.len(),
            recent = state.recent.len(),
            "restored tracker state"
        );
    }

    pub fn pattern_group_count(&self) -> usize {
        self.lock().patterns.len()
    }

    pub fn recent_condition_count(&self) -> usize {
        self.lock().recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> PatternTracker {
        PatternTracker::new(&PatternConfig::default())
    }

    fn quake_condition(timestamp: f64) -> Condition {
        Condition::new(timestamp, 3, vec!["seismic".into(), "crypto".into()], 60.0, 1.5)
    }

    #[test]
    fn test_record_condition_opens_both_keys() {
        let t = tracker();
        t.record_condition(quake_condition(1_704_067_200.0));
        assert_eq!(t.pattern_group_count(), 2);
        assert_eq!(t.recent_condition_count(), 1);

        let snap = t.snapshot();
        let group = &snap.patterns["L3_crypto_seismic"];
        assert_eq!(group.len(), EVENT_RULES.len());
        assert_eq!(group["earthquake_strong"].condition_count, 1);
    }

    #[test]
    fn test_probability_is_matched_over_total() {
        let t = tracker();
        // Four conditions before the event, six after it.
        for i in 0..4 {
            t.record_condition(quake_condition(1000.0 + i as f64));
        }
        for i in 0..6 {
            t.record_condition(quake_condition(50_000.0 + i as f64));
        }

        let events = t.check_events(&json!({ "max_magnitude": 6.5 }), 10_000.0);
        assert!(events.iter().any(|e| e.event_type == "earthquake_strong"));

        let snap = t.snapshot();
        let pattern = &snap.patterns["L3_crypto_seismic"]["earthquake_strong"];
        assert_eq!(pattern.condition_count, 10);
        assert_eq!(pattern.event_after_count, 4);
        assert!((pattern.actual_probability - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_event_does_not_double_count() {
        let t = tracker();
        for i in 0..4 {
            t.record_condition(quake_condition(1000.0 + i as f64));
        }
        t.check_events(&json!({ "max_magnitude": 6.5 }), 10_000.0);
        t.check_events(&json!({ "max_magnitude": 6.5 }), 10_100.0);

        let snap = t.snapshot();
        let pattern = &snap.patterns["L3_crypto_seismic"]["earthquake_strong"];
        assert_eq!(pattern.event_after_count, 4);
        assert!((pattern.actual_probability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_event_must_follow_condition() {
        let t = tracker();
        t.record_condition(quake_condition(10_000.0));
        // Event fires before the condition existed.
        t.check_events(&json!({ "max_magnitude": 6.5 }), 5_000.0);

        let snap = t.snapshot();
        let pattern = &snap.patterns["L3_crypto_seismic"]["earthquake_strong"];
        assert_eq!(pattern.event_after_count, 0);
    }

    #[test]
    fn test_timing_statistics() {
        let t = tracker();
        t.record_condition(quake_condition(0.0));
        t.record_condition(quake_condition(3600.0));
        // Event two hours in: lead times are 2h and 1h.
        t.check_events(&json!({ "max_magnitude": 7.5 }), 7200.0);

        let snap = t.snapshot();
        let pattern = &snap.patterns["L3_crypto_seismic"]["earthquake_major"];
        assert_eq!(pattern.min_time_to_event, 3600.0);
        assert_eq!(pattern.max_time_to_event, 7200.0);
        assert!((pattern.avg_time_to_event - 5400.0).abs() < 1e-6);
    }

    #[test]
    fn test_get_probabilities_surfaces_estimate() {
        let t = tracker();
        for i in 0..5 {
            t.record_condition(quake_condition(i as f64));
        }
        // Two hours of lead time, well past the minimum.
        t.check_events(&json!({ "max_magnitude": 6.5 }), 7200.0);

        let probs = t.get_probabilities(&quake_condition(10_000.0), None);
        let strong = probs
            .iter()
            .find(|p| p.event_type == "earthquake_strong")
            .expect("earthquake_strong estimate");
        assert!((strong.probability - 1.0).abs() < 1e-9);
        assert_eq!(strong.observations, 5);
        assert_eq!(strong.occurrences, 5);
        assert!((strong.avg_time_hours - 2.0).abs() < 0.01);
        assert!(!strong.temporal_pattern);

        // Internal-only event types never surface.
        assert!(!probs.iter().any(|p| p.event_type == "earthquake_moderate"));
        assert!(!probs.iter().any(|p| p.event_type == "earthquake_significant"));
        assert!(!probs.iter().any(|p| p.event_type == "quantum_anomaly"));
    }

    #[test]
    fn test_get_probabilities_category_filter() {
        let t = tracker();
        for i in 0..5 {
            t.record_condition(quake_condition(i as f64));
        }
        t.check_events(&json!({ "max_magnitude": 6.5 }), 7200.0);

        let crypto_only =
            t.get_probabilities(&quake_condition(10_000.0), Some(EventCategory::Crypto));
        assert!(crypto_only.is_empty());
    }

    #[test]
    fn test_get_probabilities_needs_min_observations() {
        let t = tracker();
        for i in 0..3 {
            t.record_condition(quake_condition(i as f64));
        }
        t.check_events(&json!({ "max_magnitude": 6.5 }), 7200.0);
        assert!(t.get_probabilities(&quake_condition(10_000.0), None).is_empty());
    }

    #[test]
    fn test_short_lead_time_suppressed() {
        let t = tracker();
        for i in 0..5 {
            t.record_condition(quake_condition(i as f64));
        }
        // Ten minutes of lead time: describing the present, not estimating.
        t.check_events(&json!({ "max_magnitude": 6.5 }), 600.0);
        assert!(t.get_probabilities(&quake_condition(10_000.0), None).is_empty());
    }

    #[test]
    fn test_region_attached_to_quake_estimates() {
        let t = tracker();
        for i in 0..5 {
            t.record_condition(quake_condition(i as f64 * 10.0));
        }
        let payload = json!({ "max_magnitude": 6.5, "latitude": 36.0, "longitude": 140.0 });
        t.check_events(&payload, 7200.0);

        let probs = t.get_probabilities(&quake_condition(10_000.0), None);
        let strong = probs
            .iter()
            .find(|p| p.event_type == "earthquake_strong")
            .unwrap();
        // Five matches, all in Japan.
        assert_eq!(strong.region.as_deref(), Some("Japan"));
    }

    #[test]
    fn test_calibration_stats() {
        let t = tracker();
        let mut pattern = Pattern::new("L3_crypto_seismic", "earthquake_strong");
        pattern.condition_count = 10;
        pattern.event_after_count = 4;
        pattern.update_probability();
        pattern.predicted_probability = 0.3;

        let mut group = HashMap::new();
        group.insert("earthquake_strong".to_string(), pattern);
        let mut patterns = HashMap::new();
        patterns.insert("L3_crypto_seismic".to_string(), group);
        t.restore(
            TrackerSnapshot {
                patterns,
                recent_conditions: Vec::new(),
            },
            0.0,
        );

        let stats = t.calibration_stats();
        assert_eq!(stats.total_patterns, 1);
        // (0.3 - 0.4)^2 = 0.01, well under the 0.1 cutoff.
        assert!((stats.avg_brier_score - 0.01).abs() < 1e-9);
        assert!((stats.well_calibrated_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_infinity() {
        let t = tracker();
        t.record_condition(quake_condition(1_704_067_200.0));

        let json = t.snapshot().to_json().unwrap();
        // Unmatched patterns have no minimum lead time yet.
        assert!(json.contains("\"min_time_to_event\": null"));

        let restored = TrackerSnapshot::from_json(&json).unwrap();
        let pattern = &restored.patterns["L3_crypto_seismic"]["earthquake_strong"];
        assert!(pattern.min_time_to_event.is_infinite());
    }

    #[test]
    fn test_restore_drops_stale_conditions() {
        let t = tracker();
        t.record_condition(quake_condition(1000.0));
        t.record_condition(quake_condition(500_000.0));
        let snap = t.snapshot();

        let fresh = tracker();
        // 72h lookback from t=520000 keeps only the second condition.
        fresh.restore(snap, 520_000.0);
        assert_eq!(fresh.recent_condition_count(), 1);
    }

    #[test]
    fn test_restore_keeps_newest_when_over_capacity() {
        let t = tracker();
        for i in 0..5 {
            t.record_condition(quake_condition(1000.0 + i as f64));
        }
        let snap = t.snapshot();

        let small = PatternTracker::new(&PatternConfig {
            recent_capacity: 3,
            ..PatternConfig::default()
        });
        small.restore(snap, 2000.0);
        assert_eq!(small.recent_condition_count(), 3);

        let kept: Vec<f64> = small
            .snapshot()
            .recent_conditions
            .iter()
            .map(|item| item.condition.timestamp)
            .collect();
        assert_eq!(kept, vec![1002.0, 1003.0, 1004.0]);
    }

    #[test]
    fn test_recent_buffer_bounded() {
        let t = PatternTracker::new(&PatternConfig {
            recent_capacity: 3,
            ..PatternConfig::default()
        });
        for i in 0..10 {
            t.record_condition(quake_condition(i as f64));
        }
        assert_eq!(t.recent_condition_count(), 3);
    }
}
