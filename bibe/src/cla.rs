use super::*;
use caravan_bpa::cla::link::{PacketWriter, RxChain};
use caravan_bpa::cla::{self, Sink, TxChannel, split_lower_eid};
use caravan_bpa::parser::{BundleParser, Status};

use bytes::BytesMut;
use std::sync::OnceLock;
use std::sync::atomic::Ordering;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::codec::Decoder;
use tokio_util::task::TaskTracker;

/// The Bundle-in-Bundle Encapsulation convergence-layer driver.
pub struct Bibe {
    retry: caravan_bpa::cla::tcp::Retry,
    peers: Arc<peer::PeerTable>,
    sink: OnceLock<Arc<dyn Sink>>,
    tasks: TaskTracker,
}

impl Bibe {
    pub fn new(config: &Config) -> Self {
        Self {
            retry: config.retry,
            peers: Arc::new(peer::PeerTable::default()),
            sink: OnceLock::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn sink(&self) -> Result<&Arc<dyn Sink>, Error> {
        self.sink.get().ok_or(Error::NotRegistered)
    }

    /// Launches the connection-management task for a peer not yet in the
    /// table. The caller must hold no table lock.
    async fn launch_peer(&self, sock_addr: &str, eid: &str) -> Result<(), Error> {
        if sock_addr.is_empty() {
            return Err(Error::EmptyAddress);
        }
        let sink = self.sink()?.clone();

        let peer = peer::Peer::new(sock_addr, eid);
        if !self.peers.try_insert(peer.clone()).await {
            // Raced with another start; the existing task carries on
            return Ok(());
        }

        self.tasks
            .spawn(peer.run(self.peers.clone(), self.retry, sink));
        Ok(())
    }
}

#[async_trait]
impl cla::Cla for Bibe {
    fn name(&self) -> &str {
        CLA_NAME
    }

    async fn on_register(&self, sink: Box<dyn Sink>) -> cla::Result<()> {
        // No listener: BIBE only dials out to the lower node
        _ = self.sink.set(Arc::from(sink));
        debug!("bibe: registered");
        Ok(())
    }

    async fn on_unregister(&self) {
        for peer in self.peers.drain().await {
            peer.in_contact.store(false, Ordering::Release);
            if let Some(link) = peer.state.lock().await.link.as_ref() {
                link.close();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        debug!("bibe: unregistered");
    }

    /// Returns the TX queue of the peer's link, provided the peer is
    /// connected and the address carries a valid `#<lower-eid>` suffix for
    /// the outgoing framing.
    async fn tx_channel(&self, _eid: &str, cla_addr: &str) -> Option<TxChannel> {
        let (sock_addr, lower_eid) = split_lower_eid(cla_addr);
        if !lower_eid.is_some_and(|eid| caravan_eid::validate(eid).is_ok()) {
            return None;
        }

        // Lookup and link access under the table lock, so teardown cannot
        // free the link in between
        self.peers
            .with_peer(sock_addr, async |peer| {
                let state = peer.state.lock().await;
                if !state.connected {
                    return None;
                }
                state.link.as_ref()?.tx_channel()
            })
            .await
            .flatten()
    }

    async fn start_scheduled_contact(&self, eid: &str, cla_addr: &str) -> cla::Result<()> {
        let (sock_addr, _) = split_lower_eid(cla_addr);

        let handled = self
            .peers
            .with_peer(sock_addr, async |peer| {
                info!("bibe: associating open connection with \"{cla_addr}\" to new contact");
                peer.in_contact.store(true, Ordering::Release);

                // Even if it is no new connection, notify the bundle processor
                if peer.state.lock().await.connected {
                    if let Ok(sink) = self.sink() {
                        sink.link_established(peer.cla_addr());
                    }
                }
            })
            .await
            .is_some();

        if !handled {
            self.launch_peer(sock_addr, eid)
                .await
                .map_err(|e| cla::Error::Internal(e.into()))?;
        }
        Ok(())
    }

    async fn end_scheduled_contact(&self, _eid: &str, cla_addr: &str) -> cla::Result<()> {
        let (sock_addr, _) = split_lower_eid(cla_addr);

        self.peers
            .with_peer(sock_addr, async |peer| {
                if peer.in_contact.swap(false, Ordering::AcqRel) {
                    info!("bibe: marking open connection with \"{cla_addr}\" as opportunistic");
                    if let Some(link) = peer.state.lock().await.link.as_ref() {
                        // Shut the connection down to force the lower node
                        // to deregister the tunnel sink
                        info!("bibe: terminating connection with \"{cla_addr}\"");
                        link.close();
                    }
                }
            })
            .await;
        Ok(())
    }
}

/// The receive side of a BIBE link: AAP messages, `RECVBIBE` payloads
/// parsed as BPDUs, and the encapsulated bundle bytes run through the
/// bundle parser.
pub(crate) struct BibeRxChain {
    buffer: BytesMut,
    codec: aap::Codec,
    parser: Box<dyn BundleParser>,
    sink: Arc<dyn Sink>,
    cla_addr: String,
}

impl BibeRxChain {
    pub fn new(sink: Arc<dyn Sink>, cla_addr: String) -> Self {
        Self {
            buffer: BytesMut::new(),
            codec: aap::Codec::default(),
            parser: sink.new_parser(),
            sink,
            cla_addr,
        }
    }

    fn on_message(&mut self, msg: aap::Message) {
        // WELCOME and ACK need no reaction from the CLA
        let payload = match msg {
            aap::Message::RecvBibe { payload, .. } => payload,
            other => {
                debug!("bibe: ignoring AAP message {other:?}");
                return;
            }
        };

        let bpdu = match bpdu::parse(&payload) {
            Ok(bpdu) => bpdu,
            Err(e) => {
                warn!("bibe: dropping unparseable BPDU: {e}");
                return;
            }
        };
        if bpdu.bundle.is_empty() {
            return;
        }

        match self.parser.push(&bpdu.bundle).status {
            Status::Done(bundle) => {
                if self
                    .sink
                    .dispatch(bundle, Some(self.cla_addr.clone()))
                    .is_err()
                {
                    debug!("bibe: bundle processor gone, dropping bundle");
                }
            }
            Status::Failed => warn!("bibe: encapsulated bundle rejected by parser"),
            Status::InProgress => warn!("bibe: BPDU carried an incomplete bundle, dropped"),
        }
    }
}

impl RxChain for BibeRxChain {
    fn reset(&mut self) {
        self.buffer.clear();
        self.parser.reset();
    }

    fn push(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(msg)) => {
                    self.on_message(msg);
                    // The parser chain starts afresh after every message
                    self.parser.reset();
                }
                Ok(None) => return true,
                Err(e) => {
                    // A byte stream with a bad AAP header cannot be
                    // resynchronized
                    warn!("bibe: AAP parse error: {e}");
                    return false;
                }
            }
        }
    }
}

/// The transmit side of a BIBE link: each bundle leaves as one `SENDBIBE`
/// message addressed to the lower EID from the CLA address suffix, with
/// the BPDU prefix ahead of the raw bundle bytes.
pub(crate) struct BibeWriter {
    write_half: OwnedWriteHalf,
}

impl BibeWriter {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Self { write_half }
    }
}

#[async_trait]
impl PacketWriter for BibeWriter {
    async fn begin_packet(&mut self, length: usize, cla_addr: &str) -> std::io::Result<()> {
        let (_, lower_eid) = split_lower_eid(cla_addr);
        let Some(lower_eid) = lower_eid.filter(|eid| !eid.is_empty()) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "BIBE CLA address carries no destination EID",
            ));
        };

        let prefix = bpdu::encode_prefix(0, 0, length as u64);
        let header = aap::send_bibe_header(lower_eid, (prefix.len() + length) as u64);
        self.write_half.write_all(&header).await?;
        self.write_half.write_all(&prefix).await
    }

    async fn send_packet_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(data).await
    }

    // end_packet: the default no-op; BIBE frames carry no trailer

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
    use caravan_bpa::{cla, config};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

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

    /// A bundle parser for transports whose framing already delimits whole
    /// bundles: every push is one complete bundle.
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
    async fn refused_peer_is_retried_then_terminated() {
        // Allocate a port with nothing listening behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sock_addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let table = Arc::new(peer::PeerTable::default());
        let peer = peer::Peer::new(&sock_addr, "ipn:9.0");
        assert!(table.try_insert(peer.clone()).await);

        let (sink, _events) = TestSink::new();
        let sink: Box<dyn Sink> = sink;
        peer.clone()
            .run(
                table.clone(),
                Retry {
                    max_attempts: 3,
                    interval: Duration::from_millis(10),
                },
                Arc::from(sink),
            )
            .await;

        // Initial attempt plus the full retry budget, then gone for good
        assert_eq!(peer.connect_attempts.load(Ordering::Relaxed), 4);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn tunnel_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sock_addr = listener.local_addr().unwrap().to_string();
        let cla_addr = format!("{sock_addr}#dtn://lower/");
        let reported_addr = format!("bibe:{sock_addr}");

        let (sink, mut events) = TestSink::new();
        let bibe = Bibe::new(&Config {
            retry: Retry {
                max_attempts: 1,
                interval: Duration::from_millis(10),
            },
        });
        bibe.on_register(sink).await.unwrap();
        bibe.start_scheduled_contact("dtn://peer/", &cla_addr)
            .await
            .unwrap();

        // The lower node accepts and reads our AAP registration
        let (mut stream, _) = listener.accept().await.unwrap();
        let expected = aap::encode(&aap::Message::Register {
            sink: "bibe".to_string(),
        });
        let mut register = vec![0u8; expected.len()];
        stream.read_exact(&mut register).await.unwrap();
        assert_eq!(register, expected.as_ref());

        assert_eq!(next_event(&mut events).await, Event::Up(reported_addr.clone()));

        // Inbound: WELCOME is ignored, a RECVBIBE-wrapped BPDU is delivered
        let mut recv_payload = bpdu::encode_prefix(0, 0, 8);
        recv_payload.extend_from_slice(b"incoming");
        let mut wire = aap::encode(&aap::Message::Welcome {
            eid: "dtn://lower/".to_string(),
        })
        .to_vec();
        wire.extend_from_slice(&aap::encode(&aap::Message::RecvBibe {
            eid: "dtn://lower/bibe".to_string(),
            payload: recv_payload.into(),
        }));
        tokio::io::AsyncWriteExt::write_all(&mut stream, &wire)
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            Event::Bundle(
                Bytes::from_static(b"incoming"),
                Some(reported_addr.clone())
            )
        );

        // Outbound: one SENDBIBE per transmitted bundle
        let tx = bibe
            .tx_channel("dtn://peer/", &cla_addr)
            .await
            .expect("no TX channel for a connected peer");
        tx.send_async(cla::TxItem {
            bundle: Bytes::from_static(b"outgoing"),
            dest_eid: "dtn://peer/".into(),
            cla_addr: cla_addr.clone().into(),
        })
        .await
        .unwrap();

        let mut bpdu_wire = bpdu::encode_prefix(0, 0, 8);
        bpdu_wire.extend_from_slice(b"outgoing");
        let expected = aap::encode(&aap::Message::SendBibe {
            eid: "dtn://lower/".to_string(),
            payload: bpdu_wire.into(),
        });
        let mut sent = vec![0u8; expected.len()];
        stream.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, expected.as_ref());

        // Without the #<lower-eid> suffix there is no usable TX path
        assert!(bibe.tx_channel("dtn://peer/", &sock_addr).await.is_none());

        // Ending the contact tears the connection down
        bibe.end_scheduled_contact("dtn://peer/", &cla_addr)
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, Event::Down(reported_addr));

        bibe.on_unregister().await;
        assert!(bibe.peers.is_empty().await);
    }

    #[tokio::test]
    async fn start_contact_with_empty_address_fails() {
        let (sink, _events) = TestSink::new();
        let bibe = Bibe::new(&Config::default());
        bibe.on_register(sink).await.unwrap();
        assert!(
            bibe.start_scheduled_contact("dtn://peer/", "#dtn://lower/")
                .await
                .is_err()
        );
    }

    #[test]
    fn rx_chain_resynchronization_is_fatal() {
        let (sink, _events) = TestSink::new();
        let sink: Box<dyn Sink> = sink;
        let mut chain = BibeRxChain::new(Arc::from(sink), "bibe:test".to_string());

        assert!(chain.push(&aap::encode(&aap::Message::Ack)));
        // 0x2_ is AAP version 2: unparseable, the stream is lost
        assert!(!chain.push(&[0x20]));
    }
}

