#![deny(unsafe_code)]

//! Shared test utilities for the gnlink workspace.
//!
//! Config builders, tracing setup, an in-process responder harness and
//! handlers that count their callbacks.
//!
//! ```toml
//! [dev-dependencies]
//! gnlink-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod handlers;
pub mod harness;
pub mod tracing_setup;
