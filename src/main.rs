//! Blockswap - content-addressed block exchange node

use blockswap_core::{run_node, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli()?;

    init_logging(&config.log_level);

    tracing::info!("Starting Blockswap node...");

    run_node(config).await?;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
