//! Engine tunables.

use std::time::Duration;

/// Configuration of the rollout engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on simultaneously running FSM turns.
    pub max_concurrent_jobs: usize,
    /// Delay before re-running a turn that made no progress or failed.
    pub retry_interval: chrono::Duration,
    /// Sleep between attempts to rehydrate the queue at start-up.
    pub init_retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            retry_interval: chrono::Duration::seconds(3),
            init_retry_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_jobs, 10);
        assert_eq!(config.retry_interval, chrono::Duration::seconds(3));
        assert_eq!(config.init_retry_interval, Duration::from_secs(5));
    }
}
