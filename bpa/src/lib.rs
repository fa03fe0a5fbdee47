//! Core of the Caravan DTN node: the node/contact graph, the agent registry
//! with its built-in management agent, the convergence-layer driver
//! framework, and the bundle-processor signaling boundary.
//!
//! Bundle wire-format parsing and the routing policy engine are deliberate
//! seams: see [`parser::BundleParser`] and [`processor::Forwarder`].

pub mod agent;
pub mod cla;
pub mod clock;
pub mod config;
pub mod graph;
pub mod parser;
pub mod processor;

// Common imports for submodules (accessed via `use super::*;`)
use std::sync::Arc;
use trace_err::*;
use tracing::{debug, info, warn};

// Re-export for consistency
pub use async_trait::async_trait;
pub use bytes::Bytes;
