//! Timestamp utilities

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Timestamp `age` before now, saturating for absurd ages
pub fn ago(age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
