use std::time::Duration;

use rand::Rng;

use crate::config::ConnectionConfig;

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1) + jitter, max)`, jitter uniform in `[0, max_jitter]`.
pub fn reconnect_delay(attempt: u32, config: &ConnectionConfig) -> Duration {
    let jitter_ms = if config.max_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.max_jitter_ms)
    };
    delay_with_jitter(
        attempt,
        config.base_reconnect_delay(),
        config.max_reconnect_delay(),
        Duration::from_millis(jitter_ms),
    )
}

pub(crate) fn delay_with_jitter(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: Duration,
) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(2u32.saturating_pow(exp))
        .saturating_add(jitter)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, max: u64, jitter: u64) -> ConnectionConfig {
        ConnectionConfig {
            base_reconnect_delay_ms: base,
            max_reconnect_delay_ms: max,
            max_jitter_ms: jitter,
            ..Default::default()
        }
    }

    #[test]
    fn test_base_doubling_without_jitter() {
        let cfg = config(100, 30_000, 0);
        let expected = [100, 200, 400, 800, 1_600, 3_200, 6_400, 12_800, 25_600, 30_000];
        for (i, ms) in expected.iter().enumerate() {
            let attempt = i as u32 + 1;
            assert_eq!(reconnect_delay(attempt, &cfg), Duration::from_millis(*ms), "attempt {attempt}");
        }
    }

    #[test]
    fn test_delay_within_jitter_window() {
        let cfg = config(1_000, 60_000, 250);
        for attempt in 1..=5u32 {
            let floor = Duration::from_millis(1_000 * 2u64.pow(attempt - 1));
            for _ in 0..50 {
                let d = reconnect_delay(attempt, &cfg);
                assert!(d >= floor, "attempt {attempt}: {d:?} < {floor:?}");
                assert!(d <= floor + Duration::from_millis(250), "attempt {attempt}: {d:?} too large");
            }
        }
    }

    #[test]
    fn test_capped_at_max_including_jitter() {
        let cfg = config(1_000, 5_000, 1_000);
        for _ in 0..50 {
            assert!(reconnect_delay(40, &cfg) <= Duration::from_secs(5));
        }
        let d = delay_with_jitter(3, Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        let d = delay_with_jitter(0, Duration::from_millis(100), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(d, Duration::from_millis(100));
    }
}
