//! Retry delay.

use chrono::Duration;

use crate::config::BackoffConfig;

/// Upper limit on any delay (about 30 years); keeps the value representable.
const MAX_DELAY_SECS: u64 = 1_000_000_000;

/// `min(base * 2^attempts, max)`, in whole seconds.
pub fn retry_delay(cfg: &BackoffConfig, attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    let secs = cfg.base_secs.saturating_mul(factor).min(cfg.max_secs).min(MAX_DELAY_SECS);
    Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let cfg = BackoffConfig { base_secs: 10, max_secs: 100 };
        assert_eq!(retry_delay(&cfg, 0).num_seconds(), 10);
        assert_eq!(retry_delay(&cfg, 1).num_seconds(), 20);
        assert_eq!(retry_delay(&cfg, 3).num_seconds(), 80);
        assert_eq!(retry_delay(&cfg, 4).num_seconds(), 100);
        assert_eq!(retry_delay(&cfg, 200).num_seconds(), 100);
    }

    #[test]
    fn test_zero_base_means_immediate() {
        let cfg = BackoffConfig { base_secs: 0, max_secs: 0 };
        assert_eq!(retry_delay(&cfg, 5), Duration::zero());
    }
}
