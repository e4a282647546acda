use anyhow::Result;
use clap::Parser;
use llm_gateway::config::GatewayConfig;
use llm_gateway::dispatcher::Dispatcher;
use llm_gateway::server;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// AI provider gateway server.
#[derive(Debug, Parser)]
#[command(name = "llm-gateway", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dispatcher = Dispatcher::new(config)?;
    dispatcher.clone().start();
    server::serve(dispatcher).await?;
    Ok(())
}
