use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hazel_gateway::{GatewayServerConfig, DEFAULT_GATEWAY_BIND};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "hazel-nexus",
    about = "Local chat bridge between Hazel task boards and agent app-servers",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "HAZEL_NEXUS_ROOT",
        default_value = ".",
        help = "Hazel state root containing .hazel/"
    )]
    pub(crate) root: PathBuf,

    #[arg(
        long,
        env = "HAZEL_NEXUS_BIND",
        default_value = DEFAULT_GATEWAY_BIND,
        help = "Socket address for the HTTP API (host:port)"
    )]
    pub(crate) bind: String,

    #[arg(
        long = "agent-command",
        env = "HAZEL_NEXUS_AGENT_COMMAND",
        help = "App-server command line overriding .hazel/config.yaml for chat and telemetry"
    )]
    pub(crate) agent_command: Option<String>,

    #[arg(
        long = "rpc-timeout-ms",
        env = "HAZEL_NEXUS_RPC_TIMEOUT_MS",
        default_value_t = 90_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each chat session request to the app-server"
    )]
    pub(crate) rpc_timeout_ms: u64,

    #[arg(
        long = "no-telemetry",
        help = "Do not start the usage telemetry app-server"
    )]
    pub(crate) no_telemetry: bool,
}

impl Cli {
    pub(crate) fn server_config(&self) -> GatewayServerConfig {
        let mut config = GatewayServerConfig::new(self.root.clone());
        config.bind = self.bind.clone();
        config.agent_command = self
            .agent_command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .map(str::to_string);
        config.rpc_timeout = Duration::from_millis(self.rpc_timeout_ms);
        config.telemetry_enabled = !self.no_telemetry;
        config
    }
}
