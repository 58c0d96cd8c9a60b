use std::time::Duration;

/// Default bound on simultaneously active jobs.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Configuration for the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs allowed to be active at once. The client may
    /// raise or lower this with a `config` message before submitting.
    pub max_workers: usize,

    /// How long the event loop sleeps between wake-ups while the only thing
    /// left to wait for is an externally-triggered retry of a failed job.
    pub retry_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            retry_poll_interval: Duration::from_millis(250),
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    pub fn with_retry_poll_interval(mut self, interval: Duration) -> Self {
        self.retry_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(cfg.retry_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn scheduler_config_new() {
        let cfg = SchedulerConfig::new(1);
        assert_eq!(cfg.max_workers, 1);
        assert_eq!(cfg.retry_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn scheduler_config_with_retry_poll_interval() {
        let cfg = SchedulerConfig::new(2).with_retry_poll_interval(Duration::from_millis(20));
        assert_eq!(cfg.max_workers, 2);
        assert_eq!(cfg.retry_poll_interval, Duration::from_millis(20));
    }
}
