//! Per-(source, parameter) streaming z-score classifier.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use super::window::SlidingWindow;
use crate::clock::epoch_now;
use crate::config::DetectorConfig;

/// One flagged deviation.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyRecord {
    pub timestamp: f64,
    pub source: String,
    pub parameter: String,
    pub value: f64,
    pub z_score: f64,
    pub mean: f64,
    pub std: f64,
    pub threshold: f64,
}

/// Diagnostic view of one window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

/// Classifies incoming numeric readings against an adaptive baseline.
///
/// Windows are created lazily on first observation and live for the
/// process lifetime. Flagged values still enter the window, so the
/// baseline adapts even through a burst of anomalies.
pub struct AnomalyDetector {
    window_size: usize,
    threshold: f64,
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl AnomalyDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            window_size: config.window_size,
            threshold: config.threshold,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SlidingWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(source: &str, parameter: &str) -> String {
        format!("{source}:{parameter}")
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify one reading. The z-score is computed against the window
    /// BEFORE insertion; the value is inserted regardless of the verdict.
    /// Degenerate baselines (short window, zero std) are not anomalous.
    pub fn process(&self, source: &str, parameter: &str, value: f64) -> Option<AnomalyRecord> {
        let mut windows = self.lock();
        let window = windows
            .entry(Self::key(source, parameter))
            .or_insert_with(|| SlidingWindow::new(self.window_size));

        let verdict = window.z_score(value).and_then(|z| {
            if z.abs() > self.threshold {
                Some(AnomalyRecord {
                    timestamp: epoch_now(),
                    source: source.to_string(),
                    parameter: parameter.to_string(),
                    value,
                    z_score: z,
                    mean: window.mean(),
                    std: window.std(),
                    threshold: self.threshold,
                })
            } else {
                None
            }
        });

        window.push(value);

        if let Some(record) = &verdict {
            debug!(
                source,
                parameter,
                value,
                z_score = record.z_score,
                "anomaly flagged"
            );
        }
        verdict
    }

    pub fn stats(&self, source: &str, parameter: &str) -> Option<WindowStats> {
        let windows = self.lock();
        windows.get(&Self::key(source, parameter)).map(|w| WindowStats {
            count: w.len(),
            mean: w.mean(),
            std: w.std(),
        })
    }

    /// Number of distinct (source, parameter) windows seen so far.
    pub fn window_count(&self) -> usize {
        self.lock().len()
    }

    /// Reset all windows.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
