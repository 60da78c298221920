use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

lazy_static! {
    static ref MONOTONIC_ANCHOR: Instant = Instant::now();
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Milliseconds elapsed on the process monotonic clock. Used for reload
/// cooldowns and pool idle accounting, where wall-clock jumps must not
/// shorten or extend an interval.
#[inline]
pub fn monotonic_ms() -> u64 {
    MONOTONIC_ANCHOR.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let first = monotonic_ms();
        let second = monotonic_ms();
        assert!(second >= first);
    }

    #[test]
    fn test_timestamp_is_past_2020() {
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
