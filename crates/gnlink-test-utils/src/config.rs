//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use gnlink_config::{AppConfig, Contention};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .fail_fast()
///     .dump_runs(5)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.transport.mtu = mtu;
        self
    }

    pub fn responder_port(mut self, port: u32) -> Self {
        self.config.transport.responder_port = port;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.transport.queue_depth = depth;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.config.session.contention = Contention::FailFast;
        self
    }

    pub fn acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.session.acquire_timeout_ms = ms;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn dump_runs(mut self, runs: u32) -> Self {
        self.config.demo.dump_runs = runs;
        self
    }

    pub fn dump_message(mut self, message: &str) -> Self {
        self.config.demo.dump_message = message.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
