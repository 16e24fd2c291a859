use std::sync::Arc;

use anyhow::Context;

use devbot_core::{config::Config, dispatch::QueuedDispatcher, supervisor::Supervisor};
use devbot_telegram::TelegramConnector;

mod commands;

use commands::CommandHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    devbot_core::logging::init("devbot")?;

    let cfg = Arc::new(Config::load().context("loading configuration")?);

    let (dispatcher, queue) = QueuedDispatcher::channel();
    let sup = Supervisor::new(cfg, Arc::new(TelegramConnector::new()), Arc::new(dispatcher));

    let commands = tokio::spawn(CommandHandler::new(sup.clone()).run(queue));

    sup.start().await;
    tracing::info!(status = %sup.status().await.to_json(), "devbot started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("ctrl-c received, shutting down");

    sup.shutdown().await;
    commands.abort();
    Ok(())
}
