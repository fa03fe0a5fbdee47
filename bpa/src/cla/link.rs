//! The per-link RX/TX task pair shared by every convergence-layer driver.
//!
//! A link owns two cooperating tasks: the RX task reads from the transport
//! and feeds the driver's parser chain, the TX task drains the TX queue and
//! emits packets through the driver's framing. Teardown is symmetric: either
//! task failing closes the link, a supervisor joins both tasks and reports
//! `link_down` exactly once.

use super::*;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

const SEND_CHUNK: usize = 8192;

/// The read side of a link's transport.
#[async_trait]
pub trait LinkReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl<T: tokio::io::AsyncRead + Unpin + Send> LinkReader for T {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        tokio::io::AsyncReadExt::read(self, buf).await
    }
}

/// The write side of a link's transport, including the driver's per-bundle
/// framing.
#[async_trait]
pub trait PacketWriter: Send {
    /// Writes the per-bundle framing header. `cla_addr` is the full address
    /// the router selected, `#<lower-eid>` suffix included.
    async fn begin_packet(&mut self, length: usize, cla_addr: &str) -> std::io::Result<()>;

    /// Sends part of the serialized bundle. Called repeatedly.
    async fn send_packet_data(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Terminates the bundle. Most drivers need no trailer.
    async fn end_packet(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Shuts the transport down at teardown, unblocking the peer.
    async fn shutdown(&mut self);
}

/// The driver-specific receive chain: transport framing in front of the
/// bundle parser. Completed bundles are dispatched by the chain itself.
pub trait RxChain: Send {
    /// Discards all partial parse state.
    fn reset(&mut self);

    /// Feeds received bytes through the chain. Returns `false` when the
    /// framing cannot be resynchronized and the link must be torn down.
    fn push(&mut self, data: &[u8]) -> bool;
}

/// One live link to a peer.
pub struct Link {
    cla_addr: Box<str>,
    active: AtomicBool,
    tx: Mutex<Option<TxChannel>>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Link {
    /// Starts the RX and TX tasks for a freshly connected transport.
    ///
    /// `cla_addr` is the full, name-prefixed address reported in the
    /// `link_down` signal. Reporting `link_established` is left to the
    /// driver, which does it once the link is reachable through its peer
    /// state.
    pub fn spawn(
        cla_addr: &str,
        reader: Box<dyn LinkReader>,
        writer: Box<dyn PacketWriter>,
        chain: Box<dyn RxChain>,
        sink: Arc<dyn Sink>,
    ) -> Arc<Link> {
        let link_config = sink.link_config().clone();
        let (tx, rx) = flume::bounded(link_config.tx_queue_depth.get());

        let link = Arc::new(Link {
            cla_addr: cla_addr.into(),
            active: AtomicBool::new(true),
            tx: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        let rx_task = tokio::spawn(rx_loop(link.clone(), reader, chain, link_config));
        let tx_task = tokio::spawn(tx_loop(link.clone(), writer, rx));
        tokio::spawn(supervise(link.clone(), rx_task, tx_task, sink));

        link
    }

    pub fn cla_addr(&self) -> &str {
        &self.cla_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The enqueue side of the TX queue, or `None` once the link has begun
    /// tearing down.
    pub fn tx_channel(&self) -> Option<TxChannel> {
        self.tx.lock().trace_expect("Failed to lock mutex").clone()
    }

    /// Initiates teardown: no new TX items are accepted, both tasks are
    /// told to stop, and anything still queued is dropped.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.tx.lock().trace_expect("Failed to lock mutex").take();
        self.cancel.cancel();
    }

    /// Waits until both tasks have exited and `link_down` has been reported.
    pub async fn wait(&self) {
        self.finished.cancelled().await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("cla_addr", &self.cla_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn rx_loop(
    link: Arc<Link>,
    mut reader: Box<dyn LinkReader>,
    mut chain: Box<dyn RxChain>,
    link_config: config::LinkConfig,
) {
    let mut buf = vec![0u8; link_config.read_buffer_size.max(1)];
    loop {
        let read = {
            let read = reader.read(&mut buf);
            if let Some(idle) = link_config.idle_timeout {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    r = tokio::time::timeout(idle, read) => match r {
                        Ok(r) => r,
                        Err(_) => {
                            info!("Link {}: idle timeout expired", link.cla_addr);
                            break;
                        }
                    },
                }
            } else {
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    r = read => r,
                }
            }
        };

        match read {
            Ok(0) => {
                debug!("Link {}: peer closed the connection", link.cla_addr);
                break;
            }
            Ok(n) => {
                if !chain.push(&buf[..n]) {
                    info!("Link {}: receive framing lost, tearing down", link.cla_addr);
                    break;
                }
            }
            Err(e) => {
                info!("Link {}: read failed: {e}", link.cla_addr);
                break;
            }
        }
    }
    chain.reset();
    link.close();
}

async fn tx_loop(link: Arc<Link>, mut writer: Box<dyn PacketWriter>, queue: flume::Receiver<TxItem>) {
    loop {
        let item = tokio::select! {
            _ = link.cancel.cancelled() => break,
            item = queue.recv_async() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
        };

        // A previous operation may have canceled the sending process
        if !link.is_active() {
            continue;
        }

        if let Err(e) = send_bundle(writer.as_mut(), &item).await {
            info!(
                "Link {}: error during sending, data discarded: {e}",
                link.cla_addr
            );
            link.close();
            break;
        }
        metrics::counter!("cla_bundles_sent").increment(1);
    }

    // Items that raced the close are dropped, never transmitted
    while queue.try_recv().is_ok() {}
    writer.shutdown().await;
}

async fn send_bundle(writer: &mut dyn PacketWriter, item: &TxItem) -> std::io::Result<()> {
    writer.begin_packet(item.bundle.len(), &item.cla_addr).await?;
    for chunk in item.bundle.chunks(SEND_CHUNK) {
        writer.send_packet_data(chunk).await?;
    }
    writer.end_packet().await
}

async fn supervise(
    link: Arc<Link>,
    rx_task: tokio::task::JoinHandle<()>,
    tx_task: tokio::task::JoinHandle<()>,
    sink: Arc<dyn Sink>,
) {
    _ = rx_task.await;
    _ = tx_task.await;
    link.close();
    sink.link_down(link.cla_addr.to_string());
    link.finished.cancel();
}
