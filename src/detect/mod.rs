//! Streaming anomaly detection and cross-sensor temporal clustering.

pub mod anomaly;
pub mod cluster;
pub mod window;

pub use anomaly::{AnomalyDetector, AnomalyRecord};
pub use cluster::{AnomalyEvent, Cluster, ClusterDetector, RankedCluster};
pub use window::SlidingWindow;
