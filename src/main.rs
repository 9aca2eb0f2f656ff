use clap::Parser;
use rendezvous::config::Config;
use rendezvous::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = SignalingServer::bind(&config).await?;

    println!("   Rendezvous Signaling Server");
    println!("   Binding to {}", server.local_addr()?);
    println!("   Press Ctrl+C to stop\n");

    server.run_until(shutdown_signal()).await?;
    info!("Signaling server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
