//! Minimal TCP convergence layer.
//!
//! Each bundle travels as one CBOR definite-length byte string over a plain
//! TCP connection. The driver listens for inbound peers (opportunistic
//! contacts) and dials out when a contact is scheduled.

mod cla;
mod codec;

pub mod config;

pub use cla::Mtcp;
pub use config::Config;

// Common imports for submodules (accessed via `use super::*;`)
use caravan_bpa::{Bytes, async_trait};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The CLA name, and the prefix of every mtcp CLA address.
pub const CLA_NAME: &str = "mtcp";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The CLA address has no usable transport part.
    #[error("empty CLA address, cannot initiate connection")]
    EmptyAddress,

    /// The driver is not registered with a bundle processor.
    #[error("CLA not registered with a bundle processor")]
    NotRegistered,

    #[error("failed to bind the listener: {0}")]
    Bind(std::io::Error),
}
