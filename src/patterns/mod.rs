//! Historical condition → event pattern tracking.
//!
//! The tracker observes, it does not predict: every probability it
//! reports is a measured conditional frequency with a confidence
//! qualifier, self-calibrated against what actually happened.

pub mod condition;
pub mod events;
pub mod geo;
pub mod tracker;

pub use condition::Condition;
pub use events::{EventCategory, EventRule, EventSeverity, PatternEvent, RuleKind, EVENT_RULES};
pub use tracker::{CalibrationStats, EventProbability, Pattern, PatternTracker, TrackerSnapshot};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unreadable pattern snapshot: {0}")]
    BadSnapshot(#[from] serde_json::Error),
}
