//! The bundle-processor boundary: one FIFO signaling queue between the
//! convergence layers, the local agents, and the external routing engine.
//!
//! The processor task is the only place the agent registry and the node
//! table are touched; everything else talks to them by posting signals.

use super::*;
use crate::agent::management::{self, ManagementAgent};
use thiserror::Error;

/// A specialized `Result` type for signaling operations.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("the bundle processor is no longer running")]
    Disconnected,

    #[error("the signaling queue is full")]
    Congested,
}

/// The messages carried on the signaling queue.
pub enum Signal {
    /// Request registration of a local agent.
    AgentRegister {
        sink_id: String,
        agent: Arc<dyn agent::Agent>,
        is_subscriber: bool,
    },

    /// Request removal of a local agent.
    AgentDeregister { sink_id: String },

    /// Deliver an ADU to a local agent. Posted by the forwarder.
    Deliver { sink_id: String, adu: agent::Adu },

    /// A bundle was fully parsed on a link.
    BundleReceived {
        bundle: Bytes,
        source_cla_addr: Option<String>,
    },

    /// A link became usable.
    LinkEstablished { cla_addr: String },

    /// A link was torn down.
    LinkDown { cla_addr: String },

    /// Hand a bundle to the named convergence layer for transmission.
    /// Posted by the forwarder.
    TransmissionRequest {
        bundle: Bytes,
        dest_eid: String,
        cla_addr: String,
    },

    /// Stop the processor.
    Shutdown,
}

/// A clonable sender onto the signaling queue; the cross-task face of the
/// core. Sends never block: a full queue fails the operation and the caller
/// drops its payload.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: flume::Sender<Signal>,
}

impl ProcessorHandle {
    fn send(&self, signal: Signal) -> Result<()> {
        match self.tx.try_send(signal) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                warn!("Signaling queue full, dropping signal");
                metrics::counter!("signals_dropped").increment(1);
                Err(Error::Congested)
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }

    pub fn register_agent(
        &self,
        sink_id: String,
        agent: Arc<dyn agent::Agent>,
        is_subscriber: bool,
    ) -> Result<()> {
        self.send(Signal::AgentRegister {
            sink_id,
            agent,
            is_subscriber,
        })
    }

    pub fn deregister_agent(&self, sink_id: String) -> Result<()> {
        self.send(Signal::AgentDeregister { sink_id })
    }

    pub fn deliver(&self, sink_id: String, adu: agent::Adu) -> Result<()> {
        self.send(Signal::Deliver { sink_id, adu })
    }

    pub fn dispatch_bundle(&self, bundle: Bytes, source_cla_addr: Option<String>) -> Result<()> {
        self.send(Signal::BundleReceived {
            bundle,
            source_cla_addr,
        })
    }

    pub fn link_established(&self, cla_addr: String) -> Result<()> {
        self.send(Signal::LinkEstablished { cla_addr })
    }

    pub fn link_down(&self, cla_addr: String) -> Result<()> {
        self.send(Signal::LinkDown { cla_addr })
    }

    pub fn request_transmission(
        &self,
        bundle: Bytes,
        dest_eid: String,
        cla_addr: String,
    ) -> Result<()> {
        self.send(Signal::TransmissionRequest {
            bundle,
            dest_eid,
            cla_addr,
        })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Signal::Shutdown)
    }
}

/// What the forwarder callbacks may touch: the node table, the agent
/// registry, the clock, and the handle for posting responses.
pub struct Context<'a> {
    pub nodes: &'a mut graph::NodeTable,
    pub agents: &'a mut agent::AgentRegistry,
    pub clock: &'a clock::Clock,
    pub handle: &'a ProcessorHandle,
}

/// The routing engine seam.
///
/// Callbacks run on the processor task and therefore serialize with agent
/// and node-table access. A forwarder reacts by posting `Deliver` and
/// `TransmissionRequest` signals through the handle.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn bundle_received(
        &mut self,
        ctx: Context<'_>,
        bundle: Bytes,
        source_cla_addr: Option<String>,
    );

    async fn link_established(&mut self, ctx: Context<'_>, cla_addr: &str);

    async fn link_down(&mut self, ctx: Context<'_>, cla_addr: &str);
}

/// A forwarder that drops everything; a placeholder for nodes that only
/// deliver locally.
pub struct NullForwarder;

#[async_trait]
impl Forwarder for NullForwarder {
    async fn bundle_received(
        &mut self,
        _ctx: Context<'_>,
        _bundle: Bytes,
        source_cla_addr: Option<String>,
    ) {
        debug!("No forwarder configured, dropping bundle from {source_cla_addr:?}");
    }

    async fn link_established(&mut self, _ctx: Context<'_>, _cla_addr: &str) {}

    async fn link_down(&mut self, _ctx: Context<'_>, _cla_addr: &str) {}
}

/// The bundle-processor task state.
pub struct Processor {
    clock: Arc<clock::Clock>,
    agents: agent::AgentRegistry,
    nodes: graph::NodeTable,
    clas: Arc<cla::ClaRegistry>,
    forwarder: Box<dyn Forwarder>,
    handle: ProcessorHandle,
    rx: flume::Receiver<Signal>,
}

impl Processor {
    /// Builds the processor, its signaling queue, and the CLA registry, and
    /// registers the built-in management agent.
    pub fn new(
        config: &config::Config,
        clock: Arc<clock::Clock>,
        parser_factory: Arc<dyn parser::ParserFactory>,
        forwarder: Box<dyn Forwarder>,
    ) -> core::result::Result<Self, caravan_eid::Error> {
        config.validate()?;
        let scheme = caravan_eid::scheme_of(&config.local_eid)
            .ok_or(caravan_eid::Error::UnsupportedScheme)?;

        let (tx, rx) = flume::bounded(config.signal_queue_depth.get());
        let handle = ProcessorHandle { tx };

        let mut agents = agent::AgentRegistry::new(scheme);
        agents
            .register(
                management::sink_id(scheme),
                Arc::new(ManagementAgent::new(
                    config.local_eid.clone(),
                    config.allow_remote_configuration,
                    clock.clone(),
                )),
                false,
            )
            .trace_expect("Management agent registration cannot fail");

        let clas = Arc::new(cla::ClaRegistry::new(
            config,
            handle.clone(),
            parser_factory,
        ));

        Ok(Self {
            clock,
            agents,
            nodes: graph::NodeTable::default(),
            clas,
            forwarder,
            handle,
            rx,
        })
    }

    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    pub fn cla_registry(&self) -> Arc<cla::ClaRegistry> {
        self.clas.clone()
    }

    /// Consumes signals until shutdown. Per-bundle failures are logged and
    /// the loop continues.
    pub async fn run(mut self) {
        info!("Bundle processor running");
        while let Ok(signal) = self.rx.recv_async().await {
            if !self.on_signal(signal).await {
                break;
            }
        }
        self.clas.shutdown().await;
        info!("Bundle processor stopped");
    }

    async fn on_signal(&mut self, signal: Signal) -> bool {
        match signal {
            Signal::AgentRegister {
                sink_id,
                agent,
                is_subscriber,
            } => {
                if let Err(e) = self.agents.register(&sink_id, agent, is_subscriber) {
                    warn!("Agent registration failed: {e}");
                }
            }
            Signal::AgentDeregister { sink_id } => {
                if let Err(e) = self.agents.deregister(&sink_id) {
                    info!("Agent deregistration failed: {e}");
                }
            }
            Signal::Deliver { sink_id, adu } => {
                if self.agents.forward(&sink_id, adu).is_ok() {
                    metrics::counter!("bundles_delivered").increment(1);
                }
            }
            Signal::BundleReceived {
                bundle,
                source_cla_addr,
            } => {
                metrics::counter!("bundles_received").increment(1);
                let ctx = Context {
                    nodes: &mut self.nodes,
                    agents: &mut self.agents,
                    clock: self.clock.as_ref(),
                    handle: &self.handle,
                };
                self.forwarder
                    .bundle_received(ctx, bundle, source_cla_addr)
                    .await;
            }
            Signal::LinkEstablished { cla_addr } => {
                debug!("Link established: {cla_addr}");
                let ctx = Context {
                    nodes: &mut self.nodes,
                    agents: &mut self.agents,
                    clock: self.clock.as_ref(),
                    handle: &self.handle,
                };
                self.forwarder.link_established(ctx, &cla_addr).await;
            }
            Signal::LinkDown { cla_addr } => {
                debug!("Link down: {cla_addr}");
                let ctx = Context {
                    nodes: &mut self.nodes,
                    agents: &mut self.agents,
                    clock: self.clock.as_ref(),
                    handle: &self.handle,
                };
                self.forwarder.link_down(ctx, &cla_addr).await;
            }
            Signal::TransmissionRequest {
                bundle,
                dest_eid,
                cla_addr,
            } => self.transmit(bundle, dest_eid, cla_addr).await,
            Signal::Shutdown => return false,
        }
        true
    }

    async fn transmit(&self, bundle: Bytes, dest_eid: String, cla_addr: String) {
        let (driver, transport_addr) = match self.clas.find(&cla_addr) {
            Ok(found) => found,
            Err(e) => {
                warn!("Transmission request dropped: {e}");
                return;
            }
        };

        if bundle.len() > driver.max_bundle_size() {
            warn!(
                "Bundle of {} bytes exceeds the maximum for CLA {}, dropped",
                bundle.len(),
                driver.name()
            );
            return;
        }

        let Some(tx) = driver.tx_channel(&dest_eid, &transport_addr).await else {
            warn!("No open link for {cla_addr}, dropping bundle");
            return;
        };

        if tx
            .try_send(cla::TxItem {
                bundle,
                dest_eid: dest_eid.into(),
                cla_addr: transport_addr.into(),
            })
            .is_err()
        {
            warn!("TX queue for {cla_addr} is closed or full, dropping bundle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        delivered: Mutex<Vec<agent::Adu>>,
    }

    impl agent::Agent for Recorder {
        fn deliver(&self, adu: agent::Adu) {
            self.delivered.lock().unwrap().push(adu);
        }
    }

    /// Delivers every received bundle to a fixed local sink.
    struct LoopbackForwarder {
        sink_id: String,
    }

    #[async_trait]
    impl Forwarder for LoopbackForwarder {
        async fn bundle_received(
            &mut self,
            ctx: Context<'_>,
            bundle: Bytes,
            _source_cla_addr: Option<String>,
        ) {
            _ = ctx.agents.forward(
                &self.sink_id,
                agent::Adu {
                    source: "dtn://peer/app".to_string(),
                    payload: bundle,
                },
            );
        }

        async fn link_established(&mut self, _ctx: Context<'_>, _cla_addr: &str) {}

        async fn link_down(&mut self, _ctx: Context<'_>, _cla_addr: &str) {}
    }

    struct NoParser;

    impl parser::ParserFactory for NoParser {
        fn new_parser(&self) -> Box<dyn parser::BundleParser> {
            unimplemented!("not used by these tests")
        }
    }

    #[tokio::test]
    async fn received_bundles_are_delivered_through_the_forwarder() {
        let config = config::Config {
            local_eid: "dtn://me/".to_string(),
            ..Default::default()
        };
        let processor = Processor::new(
            &config,
            Arc::new(clock::Clock::new()),
            Arc::new(NoParser),
            Box::new(LoopbackForwarder {
                sink_id: "app".to_string(),
            }),
        )
        .unwrap();

        let handle = processor.handle();
        let task = tokio::spawn(processor.run());

        let recorder = Arc::new(Recorder {
            delivered: Mutex::new(Vec::new()),
        });
        handle
            .register_agent("app".to_string(), recorder.clone(), false)
            .unwrap();
        handle
            .dispatch_bundle(
                Bytes::from_static(b"payload"),
                Some("mtcp:127.0.0.1:4224".to_string()),
            )
            .unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();

        let delivered = recorder.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn management_agent_is_preregistered() {
        let config = config::Config {
            local_eid: "ipn:12.0".to_string(),
            ..Default::default()
        };
        let clock = Arc::new(clock::Clock::new());
        let processor = Processor::new(
            &config,
            clock.clone(),
            Arc::new(NoParser),
            Box::new(NullForwarder),
        )
        .unwrap();

        let handle = processor.handle();
        let task = tokio::spawn(processor.run());

        // Set-time command from our own node
        let mut payload = vec![0x01];
        payload.extend_from_slice(&42u64.to_be_bytes());
        handle
            .deliver(
                management::SINK_IPN.to_string(),
                agent::Adu {
                    source: "ipn:12.9".to_string(),
                    payload: payload.into(),
                },
            )
            .unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();

        assert_eq!(clock.dtn_time_s(), 42);
    }

    #[tokio::test]
    async fn invalid_local_eid_is_rejected() {
        let config = config::Config {
            local_eid: "ipn:12.7".to_string(),
            ..Default::default()
        };
        assert!(
            Processor::new(
                &config,
                Arc::new(clock::Clock::new()),
                Arc::new(NoParser),
                Box::new(NullForwarder),
            )
            .is_err()
        );
    }
}
