#![deny(unsafe_code)]

//! gnlink core: an attribute-oriented request/response protocol over
//! datagrams.
//!
//! A requester sends a typed command with typed attributes to a family; the
//! responder dispatches by command id and answers with one reply, a bounded
//! dump of replies, or an error frame.
//!
//! ```text
//! transport ─▶ codec::decode ─▶ Dispatcher ─▶ policy::validate ─▶ handler
//!                                   │                              │
//!                                   └──── StreamSessionManager ◀───┘ (dumps)
//! transport ◀─ codec::encode ◀── replies
//! ```

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type of the
/// object-safe async methods on [`ipc::Transport`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Typed attribute records and the string policy.
pub mod attr;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Frame layout, encoder and decoder.
pub mod codec;
/// The `nlctrl` control family.
pub mod control;
/// The `echo_demo` family.
pub mod demo;
/// Request routing and error-frame synthesis.
pub mod dispatch;
/// Families, commands and handler traits.
pub mod family;
/// Transport contract, responder loop and client.
pub mod ipc;
/// Message model and header flags.
pub mod message;
/// In-process responder used by the CLI and tests.
pub mod node;
/// Attribute schema validation.
pub mod policy;
/// Family registry.
pub mod registry;
/// Stream session manager.
pub mod session;

pub use attr::{Attribute, AttributeKind, Attributes, IntWidth};
pub use codec::{decode, encode, CodecError};
pub use dispatch::{DispatchError, Dispatcher};
pub use family::{Command, Family, HandlerResult, OneShotHandler, StreamHandler, StreamPlan};
pub use ipc::{Client, ClientError, MemoryBus, Responder, Transport, TransportError};
pub use message::{errno, FamilyId, Flags, Message, MessageKind};
pub use node::LocalNode;
pub use policy::{AttributeSchema, PolicyViolation, Validation};
pub use registry::{Registry, RegistryError};
pub use session::{SessionError, SessionOptions, StreamSession, StreamSessionManager};
