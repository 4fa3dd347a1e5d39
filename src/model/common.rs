use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Seconds elapsed between two instants, as a float (negative if `to` precedes `from`)
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// `at + duration`, or `None` when the result leaves chrono's representable range
pub fn checked_after(at: DateTime<Utc>, duration: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}
