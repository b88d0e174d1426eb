mod bootstrap_helpers;
mod cli_args;

use anyhow::Result;
use clap::Parser;

use bootstrap_helpers::init_tracing;
use cli_args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    hazel_gateway::run_gateway_server(cli.server_config()).await
}
