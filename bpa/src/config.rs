use super::*;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkConfig {
    /// A link with no received bytes for this long is torn down.
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<std::time::Duration>,

    /// Size of the RX read buffer, per link.
    pub read_buffer_size: usize,

    /// Depth of each link's TX queue.
    pub tx_queue_depth: std::num::NonZeroUsize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(std::time::Duration::from_secs(60)),
            read_buffer_size: 4096,
            tx_queue_depth: std::num::NonZeroUsize::new(16).unwrap(),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// The node's own EID. Must validate as a local EID: an empty demux for
    /// the dtn scheme, service number zero for ipn.
    pub local_eid: String,

    /// Whether the management agent accepts commands from bundles whose
    /// source is not this node.
    pub allow_remote_configuration: bool,

    /// Depth of the bundle-processor signaling queue.
    pub signal_queue_depth: std::num::NonZeroUsize,

    #[cfg_attr(feature = "serde", serde(rename = "link"))]
    pub link_config: LinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_eid: "dtn://caravan/".to_string(),
            allow_remote_configuration: false,
            signal_queue_depth: std::num::NonZeroUsize::new(64).unwrap(),
            link_config: LinkConfig::default(),
        }
    }
}

impl Config {
    /// Checks the parts of the configuration that cannot be expressed in the
    /// type system.
    pub fn validate(&self) -> Result<(), caravan_eid::Error> {
        caravan_eid::validate_local(&self.local_eid)
    }
}
