//! The bundle wire-format seam.
//!
//! The node does not understand BPv6/BPv7 encodings; convergence-layer
//! links feed received bytes into a [`BundleParser`] supplied by the
//! embedder and hand every completed bundle to the bundle processor.

use super::*;

/// Where a streaming parse currently stands.
pub enum Status {
    /// More bytes are needed.
    InProgress,
    /// A complete bundle was recognized.
    Done(Bytes),
    /// The input is not a bundle. The caller must [`BundleParser::reset`]
    /// before feeding further bytes.
    Failed,
}

/// What one [`BundleParser::push`] call did.
pub struct Progress {
    /// Bytes consumed from the input slice. Unconsumed bytes belong to the
    /// next bundle and must be fed again after a reset.
    pub consumed: usize,
    pub status: Status,
}

/// An incremental parser for one serialized bundle.
pub trait BundleParser: Send {
    /// Discards any partial parse state.
    fn reset(&mut self);

    /// Feeds bytes into the parser.
    fn push(&mut self, data: &[u8]) -> Progress;
}

/// Creates per-link [`BundleParser`] instances.
pub trait ParserFactory: Send + Sync {
    fn new_parser(&self) -> Box<dyn BundleParser>;
}

impl<F> ParserFactory for F
where
    F: Fn() -> Box<dyn BundleParser> + Send + Sync,
{
    fn new_parser(&self) -> Box<dyn BundleParser> {
        self()
    }
}
