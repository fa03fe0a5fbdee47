use super::*;
use std::collections::HashMap;
use std::sync::RwLock;

/// The sink handed to every driver at registration: a thin shim that turns
/// driver events into bundle-processor signals.
struct ClaSink {
    handle: processor::ProcessorHandle,
    parser_factory: Arc<dyn parser::ParserFactory>,
    link_config: config::LinkConfig,
}

impl Sink for ClaSink {
    fn dispatch(&self, bundle: Bytes, source_cla_addr: Option<String>) -> Result<()> {
        metrics::counter!("cla_bundles_received").increment(1);
        self.handle
            .dispatch_bundle(bundle, source_cla_addr)
            .map_err(|_| Error::Disconnected)
    }

    fn link_established(&self, cla_addr: String) {
        if self.handle.link_established(cla_addr).is_err() {
            debug!("Dropped link_established signal: processor gone");
        }
    }

    fn link_down(&self, cla_addr: String) {
        if self.handle.link_down(cla_addr).is_err() {
            debug!("Dropped link_down signal: processor gone");
        }
    }

    fn new_parser(&self) -> Box<dyn parser::BundleParser> {
        self.parser_factory.new_parser()
    }

    fn link_config(&self) -> &config::LinkConfig {
        &self.link_config
    }
}

/// The name-keyed table of registered convergence-layer drivers.
pub struct ClaRegistry {
    clas: RwLock<HashMap<String, Arc<dyn Cla>>>,
    handle: processor::ProcessorHandle,
    parser_factory: Arc<dyn parser::ParserFactory>,
    link_config: config::LinkConfig,
}

impl ClaRegistry {
    pub(crate) fn new(
        config: &config::Config,
        handle: processor::ProcessorHandle,
        parser_factory: Arc<dyn parser::ParserFactory>,
    ) -> Self {
        Self {
            clas: Default::default(),
            handle,
            parser_factory,
            link_config: config.link_config.clone(),
        }
    }

    /// Registers a driver and launches it via [`Cla::on_register`].
    pub async fn register(&self, cla: Arc<dyn Cla>) -> Result<()> {
        let name = cla.name().to_string();

        // Scope lock
        {
            let mut clas = self.clas.write().trace_expect("Failed to lock mutex");
            if clas.contains_key(&name) {
                return Err(Error::AlreadyExists(name));
            }
            clas.insert(name.clone(), cla.clone());
        }

        if let Err(e) = cla
            .on_register(Box::new(ClaSink {
                handle: self.handle.clone(),
                parser_factory: self.parser_factory.clone(),
                link_config: self.link_config.clone(),
            }))
            .await
        {
            // Remove the CLA
            self.clas
                .write()
                .trace_expect("Failed to lock mutex")
                .remove(&name);
            return Err(e);
        }

        info!("Registered new CLA: {name}");
        Ok(())
    }

    pub async fn unregister(&self, name: &str) {
        let cla = self
            .clas
            .write()
            .trace_expect("Failed to lock mutex")
            .remove(name);

        if let Some(cla) = cla {
            cla.on_unregister().await;
            info!("Unregistered CLA: {name}");
        }
    }

    pub async fn shutdown(&self) {
        let clas = self
            .clas
            .write()
            .trace_expect("Failed to lock mutex")
            .drain()
            .collect::<Vec<_>>();

        for (name, cla) in clas {
            cla.on_unregister().await;
            info!("Unregistered CLA: {name}");
        }
    }

    /// Resolves a full CLA address to its driver and transport address.
    pub fn find(&self, cla_addr: &str) -> Result<(Arc<dyn Cla>, String)> {
        let (name, transport_addr) = parse_cla_address(cla_addr)?;
        let cla = self
            .clas
            .read()
            .trace_expect("Failed to lock mutex")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCla(cla_addr.to_string()))?;
        Ok((cla, transport_addr.to_string()))
    }
}
