//! Rolewatch daemon - Main Entry Point

mod feeder;

use anyhow::Context;
use rolewatch_engine::{config::DEFAULT_CONFIG_PATH, controller_from_config, Engine, EngineConfig, InMemoryBroker, LogSink};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Rolewatch v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("ROLEWATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = EngineConfig::resolve(&config_path).context("invalid configuration")?;

    if let Some(url) = config.broker.url.as_deref() {
        tracing::warn!("No client for broker {}, reading observations from stdin", url);
    }

    let controller = controller_from_config(&config.controller).context("controller client")?;
    tracing::info!("Enforcement via {}", controller.name());

    let broker = Arc::new(InMemoryBroker::new());
    let feeder = feeder::spawn(
        broker.clone(),
        config.broker.observation_topic.clone(),
        config.broker.action_topic.clone(),
    );

    let mut engine = Engine::new(config, broker, controller, Arc::new(LogSink)).context("engine setup")?;
    engine.start().await.context("engine start")?;

    tokio::signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("Shutdown requested");

    feeder.abort();
    engine.shutdown().await;
    Ok(())
}
