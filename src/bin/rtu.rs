use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scada_grid::config::RtuConfig;
use scada_grid::rtu;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "scada_grid=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = RtuConfig::from_env()?;
    info!(node_id = %config.node_id, "starting SCADA rtu v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { rtu::run(config, run_cancel).await });

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();

    handle.await??;
    Ok(())
}
