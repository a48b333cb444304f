//! Datagram transport contract and an in-memory bus implementing it.
//!
//! Endpoints are addressed by a `u32` port. The [`MemoryBus`] routes whole
//! datagrams between endpoints bound on the same bus through bounded tokio
//! channels; it stands in for a socket in tests, the CLI demo and embedding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::BoxFuture;

/// Errors from a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no endpoint bound at port {0}")]
    Unreachable(u32),

    #[error("port {0} is already bound")]
    AddressInUse(u32),

    #[error("transport closed")]
    Closed,
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Port of the sending endpoint.
    pub source: u32,
    pub payload: Vec<u8>,
}

/// A raw datagram send/receive endpoint.
pub trait Transport: Send + Sync + 'static {
    /// The port this endpoint is bound to.
    fn local_port(&self) -> u32;

    /// Deliver `payload` to the endpoint bound at `destination`.
    fn send(&self, payload: Vec<u8>, destination: u32) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Wait for the next datagram.
    fn receive(&self) -> BoxFuture<'_, Result<Datagram, TransportError>>;
}

struct BusInner {
    endpoints: HashMap<u32, mpsc::Sender<Datagram>>,
    next_port: u32,
}

/// In-process datagram bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
    queue_depth: usize,
}

impl MemoryBus {
    /// Create a bus whose endpoints buffer up to `queue_depth` datagrams.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                endpoints: HashMap::new(),
                next_port: 1,
            })),
            queue_depth: queue_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an endpoint at a fixed port.
    pub fn bind(&self, port: u32) -> Result<MemoryEndpoint, TransportError> {
        let mut inner = self.lock();
        if inner.endpoints.contains_key(&port) {
            return Err(TransportError::AddressInUse(port));
        }
        Ok(self.attach(&mut inner, port))
    }

    /// Bind an endpoint at the next free port.
    pub fn bind_any(&self) -> Result<MemoryEndpoint, TransportError> {
        let mut inner = self.lock();
        let start = inner.next_port;
        loop {
            let port = inner.next_port;
            inner.next_port = inner.next_port.checked_add(1).unwrap_or(1);
            if !inner.endpoints.contains_key(&port) {
                return Ok(self.attach(&mut inner, port));
            }
            if inner.next_port == start {
                return Err(TransportError::AddressInUse(port));
            }
        }
    }

    fn attach(&self, inner: &mut BusInner, port: u32) -> MemoryEndpoint {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        inner.endpoints.insert(port, tx);
        debug!(port, "endpoint bound");
        MemoryEndpoint {
            port,
            bus: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn sender(&self, port: u32) -> Option<mpsc::Sender<Datagram>> {
        self.lock().endpoints.get(&port).cloned()
    }

    fn detach(&self, port: u32) {
        self.lock().endpoints.remove(&port);
        debug!(port, "endpoint unbound");
    }

    /// Number of bound endpoints.
    pub fn endpoints(&self) -> usize {
        self.lock().endpoints.len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// An endpoint bound on a [`MemoryBus`]. Unbinds itself on drop.
pub struct MemoryEndpoint {
    port: u32,
    bus: MemoryBus,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl Transport for MemoryEndpoint {
    fn local_port(&self) -> u32 {
        self.port
    }

    fn send(&self, payload: Vec<u8>, destination: u32) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let sender = self
                .bus
                .sender(destination)
                .ok_or(TransportError::Unreachable(destination))?;
            trace!(from = self.port, to = destination, len = payload.len(), "send");
            sender
                .send(Datagram {
                    source: self.port,
                    payload,
                })
                .await
                .map_err(|_| TransportError::Unreachable(destination))
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Datagram, TransportError>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(TransportError::Closed)
        })
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.bus.detach(self.port);
    }
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
