//! Bounded exponential reconnect backoff.

use std::time::Duration;

use crate::types::TimingConfig;

/// Decides whether and when to reconnect after an unexpected close.
///
/// The Nth consecutive attempt waits `min(base * 2^N, cap)`. Once `max`
/// attempts have been scheduled without a successful open, no further
/// reconnect is scheduled.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl ReconnectPolicy {
    pub(crate) fn new(timing: &TimingConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: timing.max_reconnect_attempts,
            base: timing.reconnect_base_delay,
            cap: timing.max_reconnect_delay,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called when a connection opens.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Disable reconnection until the next successful open.
    pub(crate) fn exhaust(&mut self) {
        self.attempts = self.max_attempts;
    }

    /// Count an attempt and return its delay, or `None` when attempts are used up.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64, max: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(&TimingConfig {
            reconnect_base_delay: Duration::from_millis(base_ms),
            max_reconnect_delay: Duration::from_millis(cap_ms),
            max_reconnect_attempts: max,
            ..Default::default()
        })
    }

    #[test]
    fn delays_double_until_cap() {
        let mut p = policy(1_000, 30_000, 10);
        let delays: Vec<u64> = std::iter::from_fn(|| p.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![
                2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000, 30_000, 30_000
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn gives_up_at_max() {
        let mut p = policy(100, 1_000, 2);
        assert!(p.next_delay().is_some());
        assert!(p.next_delay().is_some());
        assert_eq!(p.next_delay(), None);
        assert_eq!(p.attempts(), 2);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut p = policy(100, 10_000, 5);
        p.next_delay();
        p.next_delay();
        p.reset();
        assert_eq!(p.next_delay(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn exhaust_blocks_reconnect() {
        let mut p = policy(100, 10_000, 5);
        p.exhaust();
        assert_eq!(p.next_delay(), None);
        p.reset();
        assert!(p.next_delay().is_some());
    }

    #[test]
    fn large_attempt_counts_saturate_at_cap() {
        let mut p = policy(1_000, 30_000, 100);
        let last = std::iter::from_fn(|| p.next_delay()).last();
        assert_eq!(last, Some(Duration::from_millis(30_000)));
    }
}
