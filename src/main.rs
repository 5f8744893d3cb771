//! Gateway binary entry point: parse arguments, install logging, load
//! and validate the configuration, run the gateway until interrupted,
//! then shut down in order.

use anyhow::Result;
use clap::Parser;
use l4_gateway::{cli::Args, config::GatewayConfig, gateway::Gateway, logging};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the whole run or file logging stops.
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref());

    let config = GatewayConfig::from_file(&args.config)?;
    config.validate()?;
    if args.validate_only {
        info!("configuration {} is valid", args.config.display());
        return Ok(());
    }

    info!(
        "starting {} v{} with configuration {}",
        config.name,
        l4_gateway::VERSION,
        args.config.display()
    );

    let gateway = Arc::new(Gateway::new(config)?);
    if let Err(err) = gateway.start().await {
        error!("gateway failed to start: {err}");
        return Err(err.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    gateway.shutdown().await;

    Ok(())
}
