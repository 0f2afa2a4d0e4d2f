//! Telemetry Bridge - Main Entry Point

use anyhow::Result;
use api::{init_logging, run, settings::config_path, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load(config_path(std::env::args().skip(1)).as_deref())?;
    init_logging(&settings.logging)?;

    info!("=== Telemetry Bridge v{} ===", env!("CARGO_PKG_VERSION"));
    run(settings).await
}
