use super::*;
use thiserror::Error;

pub mod link;
pub mod tcp;

mod registry;

pub use registry::ClaRegistry;

/// A specialized `Result` type for CLA operations.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An attempt was made to register a CLA with a name that is already in use.
    #[error("attempt to register duplicate CLA name {0}")]
    AlreadyExists(String),

    /// A CLA address did not have the `<cla-name>:<transport-addr>` shape.
    #[error("malformed CLA address {0:?}")]
    InvalidAddress(String),

    /// No driver is registered for the named convergence layer.
    #[error("no CLA registered for address {0:?}")]
    UnknownCla(String),

    /// The bundle processor is no longer running.
    #[error("the bundle processor is disconnected")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// One bundle handed to a link's TX task.
#[derive(Debug, Clone)]
pub struct TxItem {
    pub bundle: Bytes,
    /// The bundle's next-hop EID.
    pub dest_eid: Box<str>,
    /// The full CLA address the router selected, including any
    /// `#<lower-eid>` suffix the driver needs for per-bundle framing.
    pub cla_addr: Box<str>,
}

/// The enqueue side of a link's TX queue.
///
/// Holding a `TxChannel` keeps the queue alive but not the link: a send
/// after teardown fails, and items that raced the close are drained and
/// dropped, never transmitted.
pub type TxChannel = flume::Sender<TxItem>;

/// Splits a CLA address into `(cla-name, transport-addr)`.
pub fn parse_cla_address(addr: &str) -> Result<(&str, &str)> {
    addr.split_once(':')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))
}

/// Splits the optional `#<lower-eid>` suffix off a transport address.
pub fn split_lower_eid(addr: &str) -> (&str, Option<&str>) {
    match addr.split_once('#') {
        Some((sock_addr, eid)) => (sock_addr, Some(eid)),
        None => (addr, None),
    }
}

/// The contract every convergence-layer driver implements.
///
/// The per-link operations of the wire protocol (packet framing, parser
/// chain, read, disconnect) live on the [`link`] traits; this trait covers
/// the driver-wide surface the bundle processor calls.
#[async_trait]
pub trait Cla: Send + Sync {
    /// The identifier prefix of this driver's CLA addresses.
    fn name(&self) -> &str;

    /// Maximum serialized bundle size this driver can carry.
    fn max_bundle_size(&self) -> usize {
        usize::MAX
    }

    /// Called once at registration. The driver keeps the sink and starts
    /// its listener tasks, if it has any.
    async fn on_register(&self, sink: Box<dyn Sink>) -> Result<()>;

    /// Called at unregistration; the driver tears down all links and tasks.
    async fn on_unregister(&self);

    /// Returns the TX queue of an open link to the peer, or `None` if no
    /// usable link exists.
    async fn tx_channel(&self, eid: &str, cla_addr: &str) -> Option<TxChannel>;

    /// A scheduled contact with the peer has opened: mark an existing link
    /// in-contact, or begin establishing one.
    async fn start_scheduled_contact(&self, eid: &str, cla_addr: &str) -> Result<()>;

    /// The scheduled contact has closed: the link becomes opportunistic,
    /// and any held connection is shut down.
    async fn end_scheduled_contact(&self, eid: &str, cla_addr: &str) -> Result<()>;
}

/// The driver's channel back into the core.
///
/// Every method is cheap and non-blocking; calls post signals onto the
/// bundle-processor queue.
pub trait Sink: Send + Sync {
    /// Hands a fully received bundle to the bundle processor.
    fn dispatch(&self, bundle: Bytes, source_cla_addr: Option<String>) -> Result<()>;

    /// Reports that a link became usable.
    fn link_established(&self, cla_addr: String);

    /// Reports that a link was torn down.
    fn link_down(&self, cla_addr: String);

    /// Creates a bundle parser for a new link's RX chain.
    fn new_parser(&self) -> Box<dyn parser::BundleParser>;

    /// The link tuning shared by all drivers.
    fn link_config(&self) -> &config::LinkConfig;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cla_address_splits_on_first_colon() {
        assert_eq!(
            parse_cla_address("bibe:localhost:4242").unwrap(),
            ("bibe", "localhost:4242")
        );
        assert_eq!(
            parse_cla_address("mtcp:[::1]:4224").unwrap(),
            ("mtcp", "[::1]:4224")
        );
        assert!(parse_cla_address("no-colon-here").is_err());
        assert!(parse_cla_address(":addr").is_err());
    }

    #[test]
    fn lower_eid_splits_on_first_hash() {
        assert_eq!(
            split_lower_eid("localhost:4242#dtn://lower/"),
            ("localhost:4242", Some("dtn://lower/"))
        );
        assert_eq!(split_lower_eid("localhost:4242"), ("localhost:4242", None));
        assert_eq!(split_lower_eid("host#a#b"), ("host", Some("a#b")));
    }
}
