use super::*;
use crate::clock::Clock;
use caravan_eid::Scheme;

/// Sink identifier of the management agent on dtn-scheme nodes.
pub const SINK_DTN: &str = "management";
/// Sink identifier of the management agent on ipn-scheme nodes.
pub const SINK_IPN: &str = "9000";

const CMD_SET_TIME: u8 = 0x01;

/// Returns the management sink identifier for the local EID scheme.
pub fn sink_id(scheme: Scheme) -> &'static str {
    match scheme {
        Scheme::Dtn => SINK_DTN,
        Scheme::Ipn => SINK_IPN,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    SetTime(u64),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum CommandError {
    #[error("empty payload")]
    Empty,

    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),

    #[error("operand has the wrong length")]
    BadOperand,
}

fn parse_command(payload: &[u8]) -> core::result::Result<Command, CommandError> {
    let (&code, operand) = payload.split_first().ok_or(CommandError::Empty)?;
    match code {
        CMD_SET_TIME => {
            let operand: &[u8; 8] = operand
                .try_into()
                .map_err(|_| CommandError::BadOperand)?;
            Ok(Command::SetTime(u64::from_be_bytes(*operand)))
        }
        code => Err(CommandError::UnknownCommand(code)),
    }
}

/// The built-in agent that applies remote administrative commands.
///
/// Commands arrive as bundle payloads: one command byte followed by the
/// operand. Anything malformed is logged and dropped; no response bundle is
/// ever produced.
pub struct ManagementAgent {
    local_eid: String,
    allow_remote_configuration: bool,
    clock: Arc<Clock>,
}

impl ManagementAgent {
    pub fn new(local_eid: String, allow_remote_configuration: bool, clock: Arc<Clock>) -> Self {
        Self {
            local_eid,
            allow_remote_configuration,
            clock,
        }
    }

    fn origin_permitted(&self, source: &str) -> bool {
        if self.allow_remote_configuration {
            return true;
        }
        match caravan_eid::node_id(source) {
            Some(node_id) => node_id.starts_with(&self.local_eid),
            None => false,
        }
    }
}

impl Agent for ManagementAgent {
    fn deliver(&self, adu: Adu) {
        if !self.origin_permitted(&adu.source) {
            info!(
                "Management: dropped command from foreign endpoint {}",
                adu.source
            );
            return;
        }

        match parse_command(&adu.payload) {
            Ok(Command::SetTime(timestamp)) => {
                self.clock.set_dtn_time(timestamp);
                info!("Management: updated time to DTN timestamp {timestamp}");
            }
            Err(e) => info!("Management: dropped command from {}: {e}", adu.source),
        }
    }
}
