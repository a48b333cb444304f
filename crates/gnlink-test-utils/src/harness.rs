//! In-process responder harness.
//!
//! [`TestNode`] starts a [`LocalNode`] serving the `echo_demo` family,
//! optionally from a TOML file in a temp directory that lives as long as the
//! node does.

use std::path::PathBuf;
use std::sync::Arc;

use gnlink_config::AppConfig;
use gnlink_core::ipc::{Client, MemoryEndpoint};
use gnlink_core::{FamilyId, LocalNode};
use tempfile::TempDir;
use tracing::debug;

use crate::handlers::{Counters, counting_family};

pub struct TestNode {
    pub node: LocalNode,
    pub config: AppConfig,
    /// Id of the `echo_demo` family.
    pub demo_family: FamilyId,
    pub config_path: Option<PathBuf>,
    _temp_dir: Option<TempDir>,
}

impl TestNode {
    /// Start a node from an in-memory config.
    pub fn with_config(config: AppConfig) -> Self {
        let (node, demo_family) = LocalNode::demo(&config).expect("failed to start local node");
        debug!(
            port = node.responder_port(),
            demo_family,
            "test node started"
        );
        Self {
            node,
            config,
            demo_family,
            config_path: None,
            _temp_dir: None,
        }
    }

    /// Start a node from a temporary config file holding `toml_content`.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config_path = temp_dir.path().join("gnlink.toml");
        tokio::fs::write(&config_path, toml_content)
            .await
            .expect("failed to write test config");
        let config = AppConfig::load(&config_path)
            .await
            .expect("failed to parse test config");

        debug!(path = %config_path.display(), "loaded test config");
        let mut node = Self::with_config(config);
        node.config_path = Some(config_path);
        node._temp_dir = Some(temp_dir);
        node
    }

    /// Start a node with the default config.
    pub fn default_config() -> Self {
        Self::with_config(AppConfig::default())
    }

    /// A fresh client on the node's bus.
    pub fn client(&self) -> Client<MemoryEndpoint> {
        self.node.client().expect("failed to bind client endpoint")
    }

    /// Register a counting family (see [`crate::handlers`]) on the node.
    pub fn register_counting(&self, name: &str, total: u32) -> (FamilyId, Arc<Counters>) {
        let (family, counters) = counting_family(name, total);
        let id = self
            .node
            .registry()
            .register(family)
            .expect("failed to register counting family");
        (id, counters)
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await.expect("node did not shut down cleanly");
    }
}
