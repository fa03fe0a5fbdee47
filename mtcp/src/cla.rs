use super::*;
use bytes::BytesMut;
use caravan_bpa::cla::link::{Link, PacketWriter, RxChain};
use caravan_bpa::cla::{self, Sink, TxChannel, split_lower_eid, tcp};
use caravan_bpa::parser::{BundleParser, Status};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Peer {
    sock_addr: Box<str>,
    /// False for peers that connected to our listener; their link is not
    /// re-established when it drops.
    in_contact: AtomicBool,
    connect_attempts: AtomicU32,
    link: Mutex<Option<Arc<Link>>>,
}

impl Peer {
    fn new(sock_addr: &str, in_contact: bool) -> Arc<Self> {
        Arc::new(Self {
            sock_addr: sock_addr.into(),
            in_contact: AtomicBool::new(in_contact),
            connect_attempts: AtomicU32::new(0),
            link: Mutex::new(None),
        })
    }

    fn cla_addr(&self) -> String {
        format!("{CLA_NAME}:{}", self.sock_addr)
    }
}

/// The minimal TCP convergence-layer driver.
pub struct Mtcp {
    config: Config,
    peers: Arc<Mutex<HashMap<Box<str>, Arc<Peer>>>>,
    sink: OnceLock<Arc<dyn Sink>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Mtcp {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            sink: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn sink(&self) -> Result<&Arc<dyn Sink>, Error> {
        self.sink.get().ok_or(Error::NotRegistered)
    }

    /// Wires an established stream into a link and tracks it on the peer.
    /// Returns once the link has been torn down again.
    async fn run_link(peer: &Arc<Peer>, stream: TcpStream, sink: &Arc<dyn Sink>) {
        let (read_half, write_half) = stream.into_split();
        let link = Link::spawn(
            &peer.cla_addr(),
            Box::new(read_half),
            Box::new(MtcpWriter { write_half }),
            Box::new(MtcpRxChain::new(sink.clone(), peer.cla_addr())),
            sink.clone(),
        );

        *peer.link.lock().await = Some(link.clone());
        sink.link_established(peer.cla_addr());

        link.wait().await;
        *peer.link.lock().await = None;
    }

    /// The outbound connection-management loop for one scheduled peer.
    async fn manage_peer(
        peer: Arc<Peer>,
        peers: Arc<Mutex<HashMap<Box<str>, Arc<Peer>>>>,
        retry: tcp::Retry,
        sink: Arc<dyn Sink>,
    ) {
        loop {
            let Some(stream) = tcp::connect_with_retry(
                &peer.sock_addr,
                retry,
                &peer.connect_attempts,
                || peer.in_contact.load(Ordering::Acquire),
            )
            .await
            else {
                break;
            };

            info!("mtcp: connected to \"{}\"", peer.sock_addr);
            peer.connect_attempts.store(0, Ordering::Relaxed);
            Self::run_link(&peer, stream, &sink).await;

            if !peer.in_contact.load(Ordering::Acquire) {
                break;
            }
        }

        info!("mtcp: terminating link manager for \"{}\"", peer.sock_addr);
        let mut peers = peers.lock().await;
        if let Some(current) = peers.get(&peer.sock_addr) {
            if Arc::ptr_eq(current, &peer) {
                peers.remove(&peer.sock_addr);
            }
        }
    }

    /// Accepts one inbound connection as an opportunistic peer.
    async fn accept_peer(
        stream: TcpStream,
        peer_addr: std::net::SocketAddr,
        peers: Arc<Mutex<HashMap<Box<str>, Arc<Peer>>>>,
        sink: Arc<dyn Sink>,
    ) {
        let sock_addr = peer_addr.to_string();
        let peer = {
            let mut peers = peers.lock().await;
            match peers.entry(sock_addr.as_str().into()) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    // One connection per peer address
                    info!("mtcp: dropping duplicate connection from {sock_addr}");
                    return;
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(Peer::new(&sock_addr, false)).clone()
                }
            }
        };

        Self::run_link(&peer, stream, &sink).await;

        let mut peers = peers.lock().await;
        if let Some(current) = peers.get(&peer.sock_addr) {
            if Arc::ptr_eq(current, &peer) {
                peers.remove(&peer.sock_addr);
            }
        }
    }
}

#[async_trait]
impl cla::Cla for Mtcp {
    fn name(&self) -> &str {
        CLA_NAME
    }

    async fn on_register(&self, sink: Box<dyn Sink>) -> cla::Result<()> {
        let sink: Arc<dyn Sink> = Arc::from(sink);
        _ = self.sink.set(sink.clone());

        if let Some(address) = self.config.address {
            let listener = tokio::net::TcpListener::bind(address)
                .await
                .map_err(|e| cla::Error::Internal(Error::Bind(e).into()))?;
            info!("mtcp: listening on {address}");

            let peers = self.peers.clone();
            let cancel = self.cancel.clone();
            let tasks = self.tasks.clone();
            self.tasks.spawn(async move {
                tcp::listen(listener, cancel, |stream, peer_addr| {
                    tasks.spawn(Self::accept_peer(
                        stream,
                        peer_addr,
                        peers.clone(),
                        sink.clone(),
                    ));
                })
                .await
            });
        }
        Ok(())
    }

    async fn on_unregister(&self) {
        self.cancel.cancel();
        for (_, peer) in self.peers.lock().await.drain() {
            peer.in_contact.store(false, Ordering::Release);
            if let Some(link) = peer.link.lock().await.as_ref() {
                link.close();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        debug!("mtcp: unregistered");
    }

    async fn tx_channel(&self, _eid: &str, cla_addr: &str) -> Option<TxChannel> {
        let (sock_addr, _) = split_lower_eid(cla_addr);
        // Lookup and link access under the table lock, so teardown cannot
        // free the link in between
        let peers = self.peers.lock().await;
        let peer = peers.get(sock_addr)?;
        let link = peer.link.lock().await;
        link.as_ref()?.tx_channel()
    }

    async fn start_scheduled_contact(&self, _eid: &str, cla_addr: &str) -> cla::Result<()> {
        let (sock_addr, _) = split_lower_eid(cla_addr);
        if sock_addr.is_empty() {
            return Err(cla::Error::Internal(Error::EmptyAddress.into()));
        }
        let sink = self
            .sink()
            .map_err(|e| cla::Error::Internal(e.into()))?
            .clone();

        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get(sock_addr) {
            info!("mtcp: associating open connection with \"{cla_addr}\" to new contact");
            peer.in_contact.store(true, Ordering::Release);
            if peer.link.lock().await.is_some() {
                sink.link_established(peer.cla_addr());
            }
            return Ok(());
        }

        let peer = Peer::new(sock_addr, true);
        peers.insert(peer.sock_addr.clone(), peer.clone());
        self.tasks.spawn(Self::manage_peer(
            peer,
            self.peers.clone(),
            self.config.retry,
            sink,
        ));
        Ok(())
    }

    async fn end_scheduled_contact(&self, _eid: &str, cla_addr: &str) -> cla::Result<()> {
        let (sock_addr, _) = split_lower_eid(cla_addr);
        let peers = self.peers.lock().await;
        if let Some(peer) = peers.get(sock_addr) {
            if peer.in_contact.swap(false, Ordering::AcqRel) {
                info!("mtcp: marking connection with \"{cla_addr}\" as opportunistic");
                if let Some(link) = peer.link.lock().await.as_ref() {
                    link.close();
                }
            }
        }
        Ok(())
    }
}

/// The receive side of an mtcp link: CBOR byte-string frames, each one fed
/// whole to the bundle parser.
struct MtcpRxChain {
    buffer: BytesMut,
    codec: codec::Codec,
    parser: Box<dyn BundleParser>,
    sink: Arc<dyn Sink>,
    cla_addr: String,
}

impl MtcpRxChain {
    fn new(sink: Arc<dyn Sink>, cla_addr: String) -> Self {
        Self {
            buffer: BytesMut::new(),
            codec: codec::Codec::default(),
            parser: sink.new_parser(),
            sink,
            cla_addr,
        }
    }

    fn on_frame(&mut self, frame: Bytes) {
        if frame.is_empty() {
            // Keepalive
            return;
        }
        match self.parser.push(&frame).status {
            Status::Done(bundle) => {
                if self
                    .sink
                    .dispatch(bundle, Some(self.cla_addr.clone()))
                    .is_err()
                {
                    debug!("mtcp: bundle processor gone, dropping bundle");
                }
            }
            Status::Failed => warn!("mtcp: frame rejected by the bundle parser"),
            Status::InProgress => warn!("mtcp: frame carried an incomplete bundle, dropped"),
        }
        self.parser.reset();
    }
}

impl RxChain for MtcpRxChain {
    fn reset(&mut self) {
        self.buffer.clear();
        self.parser.reset();
    }

    fn push(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => return true,
                Err(e) => {
                    // Nothing downstream of a framing error can be trusted
                    warn!("mtcp: framing error: {e}");
                    return false;
                }
            }
        }
    }
}

/// The transmit side of an mtcp link: a byte-string header, then the raw
/// bundle bytes.
struct MtcpWriter {
    write_half: tokio::net::tcp::OwnedWriteHalf,
}

#[async_trait]
impl PacketWriter for MtcpWriter {
    async fn begin_packet(&mut self, length: usize, _cla_addr: &str) -> std::io::Result<()> {
        self.write_half
            .write_all(&codec::frame_header(length as u64))
            .await
    }

    async fn send_packet_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(data).await
    }

    async fn shutdown(&mut self) {
        _ = self.write_half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravan_bpa::cla::Cla as _;
    use caravan_bpa::cla::tcp::Retry;
    use caravan_bpa::parser::Progress;
    use caravan_bpa::config;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Bundle(Bytes, Option<String>),
        Up(String),
        Down(String),
    }

    struct TestSink {
        events: tokio::sync::mpsc::UnboundedSender<Event>,
        link_config: config::LinkConfig,
    }

    impl TestSink {
        fn new() -> (Box<Self>, tokio::sync::mpsc::UnboundedReceiver<Event>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            (
                Box::new(Self {
                    events: tx,
                    link_config: config::LinkConfig {
                        idle_timeout: None,
                        ..Default::default()
                    },
                }),
                rx,
            )
        }
    }

    impl Sink for TestSink {
        fn dispatch(&self, bundle: Bytes, source_cla_addr: Option<String>) -> cla::Result<()> {
            _ = self.events.send(Event::Bundle(bundle, source_cla_addr));
            Ok(())
        }

        fn link_established(&self, cla_addr: String) {
            _ = self.events.send(Event::Up(cla_addr));
        }

        fn link_down(&self, cla_addr: String) {
            _ = self.events.send(Event::Down(cla_addr));
        }

        fn new_parser(&self) -> Box<dyn BundleParser> {
            Box::new(WholeSliceParser)
        }

        fn link_config(&self) -> &config::LinkConfig {
            &self.link_config
        }
    }

    struct WholeSliceParser;

    impl BundleParser for WholeSliceParser {
        fn reset(&mut self) {}

        fn push(&mut self, data: &[u8]) -> Progress {
            Progress {
                consumed: data.len(),
                status: Status::Done(Bytes::copy_from_slice(data)),
            }
        }
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn inbound_peer_is_accepted_opportunistically() {
        let (sink, mut events) = TestSink::new();
        let mtcp = Mtcp::new(&Config {
            address: None,
            ..Default::default()
        });
        mtcp.on_register(sink).await.unwrap();

        // Drive the accept path directly, as the listener would
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let sink_arc = mtcp.sink().unwrap().clone();
        let peers = mtcp.peers.clone();
        tokio::spawn(Mtcp::accept_peer(stream, peer_addr, peers, sink_arc));

        let reported = format!("mtcp:{}", client.local_addr().unwrap());
        assert_eq!(next_event(&mut events).await, Event::Up(reported.clone()));

        // The inbound link is usable for transmission
        let tx = mtcp
            .tx_channel("dtn://peer/", &client.local_addr().unwrap().to_string())
            .await
            .expect("inbound link has no TX channel");

        tx.send_async(cla::TxItem {
            bundle: Bytes::from_static(b"out"),
            dest_eid: "dtn://peer/".into(),
            cla_addr: client.local_addr().unwrap().to_string().into(),
        })
        .await
        .unwrap();

        let mut framed = vec![0u8; 4];
        client.read_exact(&mut framed).await.unwrap();
        assert_eq!(framed, b"\x43out");

        // A frame from the peer is delivered as a bundle
        tokio::io::AsyncWriteExt::write_all(&mut client, b"\x42in")
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::Bundle(Bytes::from_static(b"in"), Some(reported.clone()))
        );

        // Closing the socket tears the opportunistic peer down for good
        drop(client);
        assert_eq!(next_event(&mut events).await, Event::Down(reported));
        mtcp.on_unregister().await;
        assert!(mtcp.peers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn scheduled_contact_dials_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sock_addr = listener.local_addr().unwrap().to_string();

        let (sink, mut events) = TestSink::new();
        let mtcp = Mtcp::new(&Config {
            address: None,
            retry: Retry {
                max_attempts: 1,
                interval: Duration::from_millis(10),
            },
        });
        mtcp.on_register(sink).await.unwrap();
        mtcp.start_scheduled_contact("dtn://peer/", &sock_addr)
            .await
            .unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::Up(format!("mtcp:{sock_addr}"))
        );

        // Bundle out through the TX queue
        let tx = mtcp.tx_channel("dtn://peer/", &sock_addr).await.unwrap();
        tx.send_async(cla::TxItem {
            bundle: Bytes::from_static(b"bundle"),
            dest_eid: "dtn://peer/".into(),
            cla_addr: sock_addr.clone().into(),
        })
        .await
        .unwrap();

        let mut framed = vec![0u8; 7];
        stream.read_exact(&mut framed).await.unwrap();
        assert_eq!(framed, b"\x46bundle");

        // Ending the contact closes the link and the peer goes away
        mtcp.end_scheduled_contact("dtn://peer/", &sock_addr)
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::Down(format!("mtcp:{sock_addr}"))
        );

        mtcp.on_unregister().await;
        assert!(mtcp.peers.lock().await.is_empty());
    }

    #[test]
    fn framing_error_is_fatal_for_the_chain() {
        let (sink, _events) = TestSink::new();
        let sink: Box<dyn Sink> = sink;
        let mut chain = MtcpRxChain::new(Arc::from(sink), "mtcp:test".to_string());

        assert!(chain.push(b"\x41a"));
        assert!(!chain.push(b"\x83"));
    }
}
