//! An in-process responder on a [`MemoryBus`], with clients on the same bus.
//!
//! Used by the CLI and the integration tests. Must be started from inside a
//! tokio runtime.

use std::sync::Arc;

use gnlink_config::AppConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::demo;
use crate::dispatch::Dispatcher;
use crate::family::FamilyError;
use crate::ipc::{Client, MemoryBus, MemoryEndpoint, Responder, TransportError};
use crate::message::FamilyId;
use crate::registry::{Registry, RegistryError};
use crate::session::{SessionOptions, StreamSessionManager};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("family: {0}")]
    Family(#[from] FamilyError),

    #[error("responder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct LocalNode {
    bus: MemoryBus,
    dispatcher: Arc<Dispatcher>,
    responder_port: u32,
    mtu: usize,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), TransportError>>>,
}

impl LocalNode {
    /// Serve `registry` according to `config`.
    pub fn start(config: &AppConfig, registry: Registry) -> Result<Self, NodeError> {
        let shutdown = CancellationToken::new();
        let sessions = StreamSessionManager::new(
            SessionOptions::from_config(&config.session),
            shutdown.child_token(),
        );
        let dispatcher = Arc::new(Dispatcher::new(registry, sessions));

        let bus = MemoryBus::new(config.transport.queue_depth);
        let endpoint = bus.bind(config.transport.responder_port)?;
        let responder = Responder::new(
            endpoint,
            Arc::clone(&dispatcher),
            config.transport.mtu,
            shutdown.clone(),
        );
        let responder_port = responder.local_port();
        let task = tokio::spawn(responder.serve());
        info!(
            port = responder_port,
            version = %crate::build_info::version_string(),
            "local node started"
        );

        Ok(Self {
            bus,
            dispatcher,
            responder_port,
            mtu: config.transport.mtu,
            shutdown,
            task: Some(task),
        })
    }

    /// Serve a fresh registry holding the `echo_demo` family.
    pub fn demo(config: &AppConfig) -> Result<(Self, FamilyId), NodeError> {
        let registry = Registry::new();
        let id = registry.register(demo::family(&config.demo)?)?;
        Ok((Self::start(config, registry)?, id))
    }

    /// A client bound to a fresh port on this node's bus.
    pub fn client(&self) -> Result<Client<MemoryEndpoint>, NodeError> {
        let endpoint = self.bus.bind_any()?;
        Ok(Client::new(endpoint, self.responder_port, self.mtu))
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Registry {
        self.dispatcher.registry()
    }

    pub fn responder_port(&self) -> u32 {
        self.responder_port
    }

    /// Stop the responder and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await??;
        }
        info!("local node stopped");
        Ok(())
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("responder_port", &self.responder_port)
            .field("mtu", &self.mtu)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
