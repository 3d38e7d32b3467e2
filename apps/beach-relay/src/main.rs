use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use beach_relay::{
    cli::{self, Cli, Commands},
    server, telemetry, RelayConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let serve_args = match cli.command {
        Some(Commands::Peer { url, id }) => {
            telemetry::init_tracing("warn")?;
            if let Err(e) = cli::run_peer(url, id).await {
                error!("Peer client error: {:#}", e);
                std::process::exit(1);
            }
            return Ok(());
        }
        Some(Commands::Serve(args)) => args,
        None => cli.serve,
    };

    telemetry::init_tracing("info")?;
    let metrics = telemetry::init_metrics()?;

    let config = RelayConfig::try_from(serve_args)?;
    info!(
        listen_addr = %config.listen_addr,
        echo_path = %config.echo_path,
        signal_path = %config.signal_path,
        idle_timeout = ?config.session.idle_timeout,
        announce_presence = config.session.announce_presence,
        "starting beach-relay"
    );

    server::run(config, Some(metrics)).await
}
