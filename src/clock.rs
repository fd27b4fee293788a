//! Wall-clock helper. All timestamps in the data model are f64 epoch seconds.

/// Current UTC time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
