use super::*;
use thiserror::Error;

pub mod management;

mod registry;

pub use registry::AgentRegistry;

/// A specialized `Result` type for agent operations.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The sink identifier does not fit the local EID scheme: a DTN demux
    /// must be VCHAR-only, an ipn sink a bare service number.
    #[error("invalid sink identifier {0:?} for the local EID scheme")]
    InvalidSink(String),

    #[error("an agent is already registered for sink {0:?}")]
    AlreadyRegistered(String),

    #[error("no agent registered for sink {0:?}")]
    NotRegistered(String),
}

/// One application data unit, delivered to exactly one agent.
///
/// An `Adu` is always moved, never borrowed: whoever holds it owns the
/// payload, and a failed delivery drops it.
#[derive(Debug)]
pub struct Adu {
    /// Source EID of the bundle that carried the payload.
    pub source: String,
    pub payload: Bytes,
}

/// A local consumer of delivered bundles.
///
/// `deliver` is invoked synchronously on the bundle-processor task; agents
/// that need to block must hand the ADU off to their own task.
pub trait Agent: Send + Sync {
    fn deliver(&self, adu: Adu);
}
