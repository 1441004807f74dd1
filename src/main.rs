use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod sources;
mod storage;
mod ui;

use crate::audio::registry::GuildRegistry;
use crate::bot::YoutubeBot;
use crate::config::Config;
use crate::sources::{FetchStage, YtDlpBackend};
use crate::storage::MediaStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("youtube_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting YouTube Bot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    let backend = Arc::new(YtDlpBackend::new(
        config.ytdl_binary.clone(),
        config.ytdl_format.clone(),
    ));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        backend.verify_dependencies().await?;
        println!("OK");
        return Ok(());
    }

    // Archivos de una ejecución anterior
    let store = Arc::new(MediaStore::new(config.download_dir.clone()).await?);
    store.purge_stale().await?;

    let fetcher = Arc::new(FetchStage::new(backend, store.clone(), config.fetch_workers));
    let registry = Arc::new(GuildRegistry::new());

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = YoutubeBot::new(config.clone(), registry.clone(), fetcher, store);

    let mut client = Client::builder(&config.bot_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Could not listen for Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("❌ Client error: {:?}", why);
    }

    registry.shutdown_all().await;
    info!("👋 Bye");

    Ok(())
}
