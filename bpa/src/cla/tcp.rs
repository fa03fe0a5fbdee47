//! The TCP base shared by the TCP-family drivers: outbound connect with a
//! bounded retry policy, and the inbound accept loop for drivers that serve
//! a port.

use super::*;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// The connect retry policy of the TCP-family drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Retry {
    /// Retries after the initial attempt. The peer is given up on after
    /// `max_attempts + 1` failed connects in a row.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub interval: std::time::Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: std::time::Duration::from_millis(1000),
        }
    }
}

/// Connects to a `host:port` transport address.
pub async fn connect(sock_addr: &str) -> std::io::Result<TcpStream> {
    TcpStream::connect(sock_addr).await
}

/// Connects with the bounded retry policy of the TCP-family drivers.
///
/// `attempts` accumulates across calls so a failed post-connect handshake
/// counts against the same budget; the caller resets it to zero once a
/// connection has been fully established. Returns `None` when the budget is
/// exhausted or `keep_trying` reports the contact has ended.
pub async fn connect_with_retry(
    sock_addr: &str,
    retry: Retry,
    attempts: &std::sync::atomic::AtomicU32,
    keep_trying: impl Fn() -> bool,
) -> Option<TcpStream> {
    loop {
        match connect(sock_addr).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                if n > retry.max_attempts {
                    info!("Final connect retry to {sock_addr} failed: {e}");
                    return None;
                }
                info!(
                    "Connect to {sock_addr} failed ({e}), delayed retry {n} of {} in {:?}",
                    retry.max_attempts, retry.interval
                );
                tokio::time::sleep(retry.interval).await;
                if !keep_trying() {
                    return None;
                }
            }
        }
    }
}

/// Accepts inbound connections until cancelled, handing each accepted
/// stream to `on_accept`.
pub async fn listen(
    listener: TcpListener,
    cancel: CancellationToken,
    mut on_accept: impl FnMut(TcpStream, std::net::SocketAddr) + Send,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {peer_addr}");
                    on_accept(stream, peer_addr);
                }
                Err(e) => {
                    // Transient accept failures (e.g. EMFILE) must not kill
                    // the listener
                    warn!("Failed to accept connection: {e}");
                }
            }
        }
    }
}
