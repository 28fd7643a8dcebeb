use std::time::Duration;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// A room's buffer is flushed once its length exceeds this.
    pub buffer_threshold: usize,
    /// Page size of the merged history view.
    pub history_page: usize,
    /// Optimistic attempts before a buffer rewrite is reported as failed.
    pub flush_max_attempts: u32,
    /// Base delay, doubled after each conflicting attempt.
    pub flush_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 100,
            history_page: 30,
            flush_max_attempts: 5,
            flush_backoff: Duration::from_millis(10),
        }
    }
}

impl GatewayConfig {
    /// Delay to wait after the `attempt`-th (1-based) conflict.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.flush_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = GatewayConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for(2), Duration::from_millis(20));
        assert_eq!(config.backoff_for(4), Duration::from_millis(80));
        assert_eq!(config.backoff_for(40), MAX_BACKOFF);
    }
}
