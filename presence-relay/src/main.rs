use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use presence_relay::{
    broker::Broker,
    cli::{BrokerArgs, Cli, Command},
    endpoint,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let broker = Broker::new(TcpListener::bind(args.listen).await?);
    info!("broker listening on {}", broker.local_addr()?);

    broker.run_until_ctrl_c().await.inspect_err(|err| {
        error!(error = ?err, "broker stopped unexpectedly");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Broker(args) => run_broker(args).await,
        Command::Endpoint(args) => endpoint::run(args).await,
    }
}
