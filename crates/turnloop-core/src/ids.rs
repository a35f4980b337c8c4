//! Opaque prefixed identifiers and millisecond timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Produces an opaque, globally unique identifier of the form
/// `<prefix>_<hex-timestamp>_<random-hex>`.
///
/// Mirrors the source runtime's `new_id`: a hex nanosecond timestamp keeps
/// ids sortable-ish without being a handle, the random suffix makes
/// collisions practically impossible even under rapid generation.
pub fn new_id(prefix: &str) -> String {
    let ts_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{ts_ns:016x}_{rand}")
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ts_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_id("evt");
        let b = new_id("evt");
        assert!(a.starts_with("evt_"));
        assert!(b.starts_with("evt_"));
        assert_ne!(a, b);
    }

    #[test]
    fn timestamps_are_monotonic_ish() {
        let a = now_ts_ms();
        let b = now_ts_ms();
        assert!(b >= a);
    }
}
