use rand_core::{OsRng, RngCore};
use std::time::Duration;

pub const PING_RETRY_BASE: Duration = Duration::from_millis(1000);
/// Largest shift applied to the base retry delay.
pub const PING_RETRY_EXP_MAX: u32 = 5;

/// Delay before re-pinging the cloud after `attempts` pings have gone out.
///
/// Every four attempts double the base delay, capped at `base << 5`.
/// `jitter` adds `jitter % (delay / 2)` on top.
pub fn ping_retry_delay(attempts: u32, jitter: u32) -> Duration {
    let exp = (attempts >> 2).min(PING_RETRY_EXP_MAX);
    let delay_ms = (PING_RETRY_BASE.as_millis() as u64) << exp;
    Duration::from_millis(delay_ms + u64::from(jitter) % (delay_ms / 2))
}

pub fn random_jitter() -> u32 {
    OsRng.next_u32()
}

pub(crate) fn bounded_backoff_next(current: Duration, max: Duration) -> Duration {
    let current_ms = current.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(current_ms.saturating_mul(2).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_every_four_attempts() {
        assert_eq!(ping_retry_delay(1, 0), Duration::from_millis(1000));
        assert_eq!(ping_retry_delay(3, 0), Duration::from_millis(1000));
        assert_eq!(ping_retry_delay(4, 0), Duration::from_millis(2000));
        assert_eq!(ping_retry_delay(8, 0), Duration::from_millis(4000));
        assert_eq!(ping_retry_delay(400, 0), Duration::from_millis(32_000));
    }

    #[test]
    fn jitter_stays_below_half_the_delay() {
        for jitter in [0, 1, 999, 1000, 1001, u32::MAX] {
            let delay = ping_retry_delay(4, jitter);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay < Duration::from_millis(3000));
        }
    }

    #[test]
    fn bounded_backoff_caps_at_max() {
        assert_eq!(
            bounded_backoff_next(Duration::from_secs(1), Duration::from_secs(600)),
            Duration::from_secs(2)
        );
        assert_eq!(
            bounded_backoff_next(Duration::from_secs(512), Duration::from_secs(600)),
            Duration::from_secs(600)
        );
    }
}
