//! # Bot Module
//!
//! Discord glue for the jukebox: slash command registration, interaction
//! dispatch and voice-state forwarding.
//!
//! ## Architecture
//!
//! [`JukeboxBot`] implements serenity's [`EventHandler`]. Playback decisions
//! live in the [`Orchestrator`], which is stored in the client's `TypeMap`
//! once the client (and with it the HTTP client and cache the chat adapter
//! needs) has been built.
//!
//! - [`commands`] - slash command definitions
//! - [`handlers`] - one handler per command, plain-text replies
//! - [`chat`] - [`ChatPlatform`](crate::audio::chat::ChatPlatform) over serenity

use anyhow::Result;
use serenity::{
    all::{ActivityData, Context, EventHandler, GuildId, Interaction, Ready, ShardManager, VoiceState},
    async_trait,
    prelude::TypeMapKey,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub mod chat;
pub mod commands;
pub mod handlers;

use crate::{
    audio::{
        events::{EventSender, OrchestratorEvent},
        orchestrator::Orchestrator,
    },
    config::Config,
    error::PlaybackError,
    sources::TrackResolver,
    storage::GuildSettingsStore,
};

impl TypeMapKey for Orchestrator {
    type Value = Arc<Orchestrator>;
}

/// Acceso al shard manager desde los comandos (latencia en `/ping`)
pub struct ShardManagerContainer;

impl TypeMapKey for ShardManagerContainer {
    type Value = Arc<ShardManager>;
}

/// Main Discord event handler.
///
/// ## Fields
///
/// - `config`: Bot configuration (tokens, limits)
/// - `storage`: Persisted per-guild volume
/// - `resolver`: Turns `/play` queries into playable items
/// - `events`: Orchestrator event channel, used to forward presence changes
pub struct JukeboxBot {
    config: Arc<Config>,
    pub storage: Arc<Mutex<GuildSettingsStore>>,
    pub resolver: Arc<dyn TrackResolver>,
    events: EventSender,
}

impl JukeboxBot {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<Mutex<GuildSettingsStore>>,
        resolver: Arc<dyn TrackResolver>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            storage,
            resolver,
            events,
        }
    }

    /// Orquestador registrado en el `TypeMap` del cliente
    pub async fn orchestrator(&self, ctx: &Context) -> Result<Arc<Orchestrator>> {
        let data = ctx.data.read().await;
        data.get::<Orchestrator>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Orquestador no inicializado"))
    }

    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        match self.config.guild_id {
            Some(guild_id) => {
                commands::register_guild_commands(ctx, GuildId::new(guild_id)).await?;
                info!("✅ Comandos registrados en guild {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Comandos globales registrados");
            }
        }
        Ok(())
    }

    /// El bot fue sacado del canal (kick, move a nada, caída de la conexión)
    async fn on_bot_disconnected(&self, ctx: &Context, guild_id: GuildId) {
        let orchestrator = match self.orchestrator(ctx).await {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                error!("{:?}", e);
                return;
            }
        };

        // Un leave propio también llega por aquí, con el estado ya destruido
        let connected = orchestrator.snapshot(guild_id).await.is_some_and(|s| s.connected);
        if !connected {
            return;
        }

        info!("🔌 Bot desconectado externamente en guild {}", guild_id);
        match orchestrator.leave(guild_id).await {
            Ok(()) => {}
            Err(PlaybackError::NotConnected) => debug!("Guild {} ya estaba limpio", guild_id),
            Err(e) => warn!("Error limpiando guild {}: {}", guild_id, e),
        }
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        ctx.set_activity(Some(ActivityData::listening("/play")));
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Forwards every voice-state change in a guild as a presence change,
    /// and tears the guild down when the bot itself leaves its channel.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let current_user_id = ctx.cache.current_user().id;
        if new.user_id == current_user_id && old.is_some() && new.channel_id.is_none() {
            self.on_bot_disconnected(&ctx, guild_id).await;
            return;
        }

        if self.events.send(OrchestratorEvent::PresenceChanged { guild_id }).is_err() {
            warn!("Canal de eventos cerrado, cambio de presencia descartado");
        }
    }
}
