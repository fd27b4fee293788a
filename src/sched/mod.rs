//! Cooperative, priority-aware repeating-task scheduler.
//!
//! Drives sensor polling cadence and periodic maintenance. A task is
//! never re-entered while a previous run is still in flight, and a
//! failing task never takes the loop (or its neighbors) down with it.

pub mod engine;

pub use engine::{Scheduler, TaskHandler};

use serde::Serialize;

/// Dispatch priority when execution is resource-constrained.
/// Lower discriminant = dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// Execution history of one registered task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub run_count: u64,
    pub error_count: u64,
    /// Reset to zero on a successful run; the health monitor watches this.
    pub consecutive_failures: u64,
    /// Epoch seconds of the most recent dispatch.
    pub last_run: Option<f64>,
    /// Rolling average over all completed runs.
    pub avg_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
    }
}
