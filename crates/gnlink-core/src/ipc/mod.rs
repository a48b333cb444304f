//! Transport plumbing: the datagram contract, the responder loop and the
//! requester client.
//!
//! ```text
//! ┌──────────┐      datagrams       ┌────────────┐     ┌────────────┐
//! │  Client  │─────────────────────▶│ Responder  │────▶│ Dispatcher │
//! │          │◀─────────────────────│ (serve)    │◀────│            │
//! └──────────┘   replies / parts    └────────────┘     └────────────┘
//! ```

pub mod client;
pub mod server;
pub mod transport;

pub use client::{Client, ClientError};
pub use server::Responder;
pub use transport::{Datagram, MemoryBus, MemoryEndpoint, Transport, TransportError};
