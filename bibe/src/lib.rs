//! Bundle-in-Bundle Encapsulation (BIBE) convergence layer.
//!
//! The driver connects to the Application Agent Protocol (AAP) socket of an
//! adjacent node, registers the tunnel sink there, and exchanges bundles as
//! BIBE protocol data units carried in AAP messages. One connection-management
//! task per peer runs the connect/handshake/retry state machine.

mod aap;
mod bpdu;
mod cla;
mod peer;

pub mod config;

pub use cla::Bibe;
pub use config::Config;

// Common imports for submodules (accessed via `use super::*;`)
use caravan_bpa::{Bytes, async_trait};
use std::sync::Arc;
use trace_err::*;
use tracing::{debug, info, warn};

/// The CLA name, and the prefix of every BIBE CLA address.
pub const CLA_NAME: &str = "bibe";

/// The sink registered at the lower node when the peer uses the dtn scheme.
const LOWER_SINK_DTN: &str = "bibe";
/// The sink registered at the lower node when the peer uses the ipn scheme.
const LOWER_SINK_IPN: &str = "2925";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The CLA address has no usable transport part.
    #[error("empty CLA address, cannot initiate connection")]
    EmptyAddress,

    /// The driver is not registered with a bundle processor.
    #[error("CLA not registered with a bundle processor")]
    NotRegistered,
}
