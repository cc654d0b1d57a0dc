//! Process entrypoint: parses configuration from the environment, installs
//! the tracing subscriber, and hands off to [`hub_core::run`].

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use hub_core::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        listen_addr = %config.listen_addr,
        ws_listen_addr = %config.ws_listen_addr,
        "starting hub"
    );

    hub_core::run(config).await
}
