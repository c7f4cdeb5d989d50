use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scada_grid::bootstrap;
use scada_grid::config::MasterConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "scada_grid=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting SCADA master v{}", env!("CARGO_PKG_VERSION"));

    let config = MasterConfig::from_env()?;
    bootstrap::run(config).await
}
