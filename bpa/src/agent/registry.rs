use super::*;
use caravan_eid::Scheme;
use std::collections::HashMap;

struct Registration {
    agent: Arc<dyn Agent>,
    is_subscriber: bool,
}

/// The process-wide sink-id → agent mapping.
///
/// Not thread-safe on purpose: the registry is owned by the bundle-processor
/// task, and every cross-task registration or delivery arrives as a signal.
pub struct AgentRegistry {
    scheme: Scheme,
    agents: HashMap<String, Registration>,
}

impl AgentRegistry {
    /// `scheme` is the scheme of the node's own EID; it decides how sink
    /// identifiers are validated.
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            agents: HashMap::new(),
        }
    }

    fn validate_sink(&self, sink_id: &str) -> Result<()> {
        let valid = match self.scheme {
            Scheme::Dtn => caravan_eid::validate_demux(sink_id).is_ok(),
            Scheme::Ipn => caravan_eid::parse_ipn_service(sink_id).is_ok(),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidSink(sink_id.to_string()))
        }
    }

    pub fn register(
        &mut self,
        sink_id: &str,
        agent: Arc<dyn Agent>,
        is_subscriber: bool,
    ) -> Result<()> {
        self.validate_sink(sink_id)?;
        if self.agents.contains_key(sink_id) {
            return Err(Error::AlreadyRegistered(sink_id.to_string()));
        }
        self.agents.insert(
            sink_id.to_string(),
            Registration {
                agent,
                is_subscriber,
            },
        );
        info!("Agent registered for sink \"{sink_id}\"");
        Ok(())
    }

    pub fn deregister(&mut self, sink_id: &str) -> Result<()> {
        if self.agents.remove(sink_id).is_none() {
            return Err(Error::NotRegistered(sink_id.to_string()));
        }
        info!("Agent deregistered for sink \"{sink_id}\"");
        Ok(())
    }

    /// Delivers `adu` to the agent registered for `sink_id`.
    ///
    /// Ownership of the ADU is surrendered unconditionally: with no agent
    /// registered the payload is dropped and an error returned.
    pub fn forward(&self, sink_id: &str, adu: Adu) -> Result<()> {
        let Some(registration) = self.agents.get(sink_id) else {
            info!("No agent registered for sink \"{sink_id}\", dropping ADU");
            return Err(Error::NotRegistered(sink_id.to_string()));
        };
        registration.agent.deliver(adu);
        Ok(())
    }

    /// The routing hint recorded at registration.
    pub fn is_subscriber(&self, sink_id: &str) -> Option<bool> {
        self.agents.get(sink_id).map(|r| r.is_subscriber)
    }
}
