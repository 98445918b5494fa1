// ── Outbound commands ──
//
// Closed command vocabulary routed through the shared client, so every
// command is bounded by the same transport permits and retry policy as
// the bulk loads.

use isy_api::IsyClient;

use crate::error::CoreError;
use crate::model::{Address, VariableKind};

/// Node command path segments.
const CMD_ON: &str = "DON";
const CMD_OFF: &str = "DOF";
const CMD_FAST_ON: &str = "DFON";
const CMD_FAST_OFF: &str = "DFOF";

/// Every operation the engine can ask the controller to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Turn a node on, optionally at a 0-255 level.
    NodeOn { address: Address, level: Option<u8> },
    NodeOff { address: Address },
    NodeFastOn { address: Address },
    NodeFastOff { address: Address },
    /// Ask the controller to re-query the device.
    NodeQuery { address: Address },
    NodeEnable { address: Address, enabled: bool },

    ProgramRun { address: Address },
    ProgramRunThen { address: Address },
    ProgramRunElse { address: Address },
    ProgramStop { address: Address },
    ProgramEnable { address: Address, enabled: bool },

    SetVariable {
        kind: VariableKind,
        id: u32,
        value: i64,
        /// Set the init (power-on) value instead of the current value.
        init: bool,
    },

    RunNetworkResource { id: u32 },
}

/// Execute one command against the controller.
pub(crate) async fn run(client: &IsyClient, command: &Command) -> Result<(), CoreError> {
    match command {
        Command::NodeOn { address, level } => {
            let level = level.map(|l| l.to_string());
            client
                .send_node_command(address.as_str(), CMD_ON, level.as_deref(), None)
                .await?;
        }
        Command::NodeOff { address } => {
            client
                .send_node_command(address.as_str(), CMD_OFF, None, None)
                .await?;
        }
        Command::NodeFastOn { address } => {
            client
                .send_node_command(address.as_str(), CMD_FAST_ON, None, None)
                .await?;
        }
        Command::NodeFastOff { address } => {
            client
                .send_node_command(address.as_str(), CMD_FAST_OFF, None, None)
                .await?;
        }
        Command::NodeQuery { address } => {
            client.query_node(address.as_str()).await?;
        }
        Command::NodeEnable { address, enabled } => {
            client.set_node_enabled(address.as_str(), *enabled).await?;
        }
        Command::ProgramRun { address } => {
            client.send_program_command(address.as_str(), "run").await?;
        }
        Command::ProgramRunThen { address } => {
            client.send_program_command(address.as_str(), "runThen").await?;
        }
        Command::ProgramRunElse { address } => {
            client.send_program_command(address.as_str(), "runElse").await?;
        }
        Command::ProgramStop { address } => {
            client.send_program_command(address.as_str(), "stop").await?;
        }
        Command::ProgramEnable { address, enabled } => {
            let verb = if *enabled { "enable" } else { "disable" };
            client.send_program_command(address.as_str(), verb).await?;
        }
        Command::SetVariable { kind, id, value, init } => {
            client
                .set_variable(kind.wire_code(), *id, *init, *value)
                .await?;
        }
        Command::RunNetworkResource { id } => {
            client.run_network_resource(&id.to_string()).await?;
        }
    }
    Ok(())
}
