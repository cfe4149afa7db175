use anyhow::{
    Context,
    Result,
};
use clap::Parser;
use coverage_monitor::{
    RpcEventSource,
    TracingSink,
    cli::Args,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};
use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args
        .monitor_config()
        .context("invalid command line configuration")?;

    let source = RpcEventSource::connect_http(args.rpc_url.clone(), args.address)
        .with_cursor_span(config.chunk_size);

    let shutdown = CancellationToken::new();

    // Spawn signal handler
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!("Error setting up signal handler: {}", e);
        } else {
            info!("Shutdown signal received, stopping monitor...");
            shutdown_trigger.cancel();
        }
    });

    coverage_monitor::run(source, TracingSink, config, shutdown)
        .await
        .context("coverage monitor terminated")
}

/// Wait for SIGTERM or SIGINT (Ctrl+C)
async fn shutdown_signal() -> Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
