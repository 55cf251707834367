use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod sources;
mod storage;

use crate::audio::{
    events,
    orchestrator::{Orchestrator, OrchestratorSettings},
    songbird_backend::SongbirdBackend,
};
use crate::bot::{chat::SerenityChat, JukeboxBot, ShardManagerContainer};
use crate::config::Config;
use crate::sources::YtDlpResolver;
use crate::storage::GuildSettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let resolver = YtDlpResolver::new(config.max_playlist_size);
    match resolver.verify().await {
        Ok(version) => info!("✅ yt-dlp versión: {}", version),
        Err(e) => error!("❌ {:?}", e),
    }

    // Inicializar almacenamiento JSON
    let storage = GuildSettingsStore::new(config.data_dir.clone()).await?;
    info!("💾 {} servidores con preferencias guardadas", storage.guild_count());
    let storage = Arc::new(tokio::sync::Mutex::new(storage));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let (events_tx, events_rx) = events::channel();
    let handler = JukeboxBot::new(Arc::clone(&config), storage, Arc::new(resolver), events_tx.clone());

    // Construir cliente
    let songbird = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(Arc::clone(&songbird))
        .await?;

    // El chat necesita el HTTP y la caché del cliente ya construido
    let chat = Arc::new(SerenityChat::new(Arc::clone(&client.http), Arc::clone(&client.cache)));
    let backend = Arc::new(SongbirdBackend::new(songbird, events_tx.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::from(config.as_ref()),
        backend,
        chat,
        events_tx,
    ));
    let _event_loop = orchestrator.spawn_event_loop(events_rx);

    {
        let mut data = client.data.write().await;
        data.insert::<Orchestrator>(Arc::clone(&orchestrator));
        data.insert::<ShardManagerContainer>(Arc::clone(&client.shard_manager));
    }

    // Manejar shutdown graceful
    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!(
            "⚠️ Señal de shutdown recibida, cerrando {} sesiones...",
            orchestrator.active_guilds()
        );
        orchestrator.disconnect_all().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
