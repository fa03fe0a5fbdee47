use caravan_bpa::cla::tcp::Retry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// The TCP address to listen on for inbound peers. `None` makes the
    /// driver purely outbound.
    pub address: Option<std::net::SocketAddr>,

    /// Connect retry policy for scheduled contacts.
    pub retry: Retry,
}
