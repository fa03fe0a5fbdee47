use caravan_bpa::cla::tcp::Retry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Connect retry policy towards the lower node's AAP socket.
    pub retry: Retry,
}
