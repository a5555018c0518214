use anyhow::Context as _;
use clap::Parser as _;
use pine_dns::{setup_logging, Args, DnsServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.log_level.as_deref())?;

    let config = ServerConfig::try_from(args).context("invalid configuration")?;
    let workers = config.workers;

    let mut server = DnsServer::new(config)
        .await
        .context("failed to instantiate the DNS server")?;

    server.add_workers(workers).await;

    server.block_until_completion().await
}
