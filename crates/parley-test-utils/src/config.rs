//! Config builders tuned for fast tests.

use parley_config::AppConfig;

/// Builder for an [`AppConfig`] with test-friendly timings.
///
/// Defaults to millisecond-scale retry delays and a short slow-generation
/// deadline so paused-clock tests finish instantly.
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.queue.base_delay_ms = 10;
        config.queue.max_delay_ms = 1_000;
        config.queue.tick_secs = 1;
        config.rewrite.deadline_secs = 5;
        Self { config }
    }

    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.config.queue.base_delay_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.queue.max_retries = retries;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    pub fn deadline_secs(mut self, secs: u64) -> Self {
        self.config.rewrite.deadline_secs = secs;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}
