//! Timestamp helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// The timestamp `age` before now.
pub fn millis_ago(age: Duration) -> i64 {
    now_millis().saturating_sub(i64::try_from(age.as_millis()).unwrap_or(i64::MAX))
}

/// Convert a filesystem timestamp to milliseconds since the Unix epoch.
pub fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_millis_ago() {
        let earlier = millis_ago(Duration::from_secs(1));
        let now = now_millis();
        assert!(now - earlier >= 1000);
        assert!(millis_ago(Duration::MAX) < 0);
    }

    #[test]
    fn test_epoch_is_zero() {
        assert_eq!(system_time_millis(UNIX_EPOCH), 0);
    }
}
