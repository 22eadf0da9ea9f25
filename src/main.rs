//! kbhub entrypoint.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kbhub::config::Config;
use kbhub::context::ServiceContext;
use kbhub::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let ctx = ServiceContext::initialize(config)
        .await
        .context("failed to initialize service context")?;

    tokio::select! {
        result = server::start_server(ctx.clone()) => {
            result.context("server terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    ctx.shutdown().await;
    Ok(())
}
