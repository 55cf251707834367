use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandDataOptionValue, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
    audio::{
        announcer::{format_duration, now_playing_line},
        orchestrator::{GuildSnapshot, Orchestrator, PlayOutcome, PlayRequest, SkipReport, StopReport},
        queue::{PlayableItem, QueuePage},
        state::{LoopCount, LoopPolicy, PlaybackPhase},
    },
    bot::{JukeboxBot, ShardManagerContainer},
    error::PlaybackError,
};

const QUEUE_PAGE_SIZE: usize = 10;
const SEARCH_RESULTS: usize = 10;
const HISTORY_SHOWN: usize = 10;

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let orchestrator = bot.orchestrator(ctx).await?;

    let content = match command.data.name.as_str() {
        "play" => return handle_play(ctx, &command, bot, &orchestrator, guild_id).await,
        "search" => return handle_search(ctx, &command, bot).await,
        "join" => return handle_join(ctx, &command, bot, &orchestrator, guild_id).await,
        "skip" => {
            let amount = int_option(&command, "amount").unwrap_or(1).max(1) as usize;
            orchestrator.skip(guild_id, amount).await.map(|report| skip_reply(&report))
        }
        "stop" => orchestrator.stop(guild_id).await.map(|report| stop_reply(&report)),
        "loop" => {
            let policy = match int_option(&command, "times") {
                None => LoopPolicy::Track(LoopCount::Infinite),
                Some(times) => LoopPolicy::Track(LoopCount::Finite(times.max(0) as u64)),
            };
            orchestrator
                .set_loop(guild_id, policy)
                .await
                .map(|policy| format!("🔁 Loop: {}", policy))
        }
        "volume" => return handle_volume(ctx, &command, bot, &orchestrator, guild_id).await,
        "pause" => orchestrator.pause(guild_id).await.map(|changed| {
            let text = if changed { "⏸️ Pausado" } else { "ℹ️ La reproducción ya está pausada" };
            text.to_string()
        }),
        "resume" => orchestrator.resume(guild_id).await.map(|changed| {
            let text = if changed { "▶️ Reanudado" } else { "ℹ️ La reproducción no está pausada" };
            text.to_string()
        }),
        "shuffle" => orchestrator
            .shuffle(guild_id)
            .await
            .map(|count| format!("🔀 Cola mezclada ({} canciones)", count)),
        "remove" => {
            let position = int_option(&command, "position").unwrap_or(0).max(0) as usize;
            orchestrator
                .remove(guild_id, position)
                .await
                .map(|item| format!("➖ Quitado de la cola: **{}**", item.title))
        }
        "history" => match orchestrator.history(guild_id, HISTORY_SHOWN).await {
            Some(items) => Ok(history_reply(&items)),
            None => Err(PlaybackError::NotConnected),
        },
        "queue" => {
            let page = int_option(&command, "page").unwrap_or(1).max(1) as usize;
            match (
                orchestrator.snapshot(guild_id).await,
                orchestrator.queue_page(guild_id, page, QUEUE_PAGE_SIZE).await,
            ) {
                (Some(snapshot), Some(page)) => Ok(queue_reply(&snapshot, &page)),
                _ => Err(PlaybackError::NotConnected),
            }
        }
        "nowplaying" => match orchestrator.snapshot(guild_id).await {
            Some(snapshot) => nowplaying_reply(&snapshot),
            None => Err(PlaybackError::NotConnected),
        },
        "leave" => orchestrator
            .leave(guild_id)
            .await
            .map(|()| "👋 Desconectado del canal de voz".to_string()),
        "ping" => return handle_ping(ctx, &command).await,
        "help" => Ok(help_text()),
        other => {
            warn!("Comando desconocido: {}", other);
            return reply(ctx, &command, "❌ Comando no reconocido", true).await;
        }
    };

    match content {
        Ok(content) => reply(ctx, &command, content, false).await,
        Err(e) => reply(ctx, &command, error_reply(&e), true).await,
    }
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    orchestrator: &Arc<Orchestrator>,
    guild_id: GuildId,
) -> Result<()> {
    let Some(query) = string_option(command, "query").map(str::to_string) else {
        return reply(ctx, command, "❌ Falta la búsqueda", true).await;
    };
    let Some(voice_channel) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return reply(ctx, command, "❌ Debes estar en un canal de voz", true).await;
    };

    // La resolución puede tardar más de los 3s que da Discord
    command.defer(&ctx.http).await?;

    let items = match bot.resolver.resolve(&query).await {
        Ok(items) => items,
        Err(e) => {
            warn!("No se pudo resolver '{}': {:?}", query, e);
            return edit(ctx, command, format!("❌ {}", e)).await;
        }
    };

    let volume_pct = bot.storage.lock().await.volume(guild_id.get());
    let request = PlayRequest {
        guild_id,
        voice_channel,
        text_channel: command.channel_id,
        items,
        volume_pct,
    };

    let content = match orchestrator.play(request).await {
        Ok(outcome) => play_reply(&outcome),
        Err(e) => error_reply(&e),
    };
    edit(ctx, command, content).await
}

async fn handle_search(ctx: &Context, command: &CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let Some(query) = string_option(command, "query").map(str::to_string) else {
        return reply(ctx, command, "❌ Falta la búsqueda", true).await;
    };

    command.defer(&ctx.http).await?;
    let content = match bot.resolver.search(&query, SEARCH_RESULTS).await {
        Ok(items) => search_reply(&items),
        Err(e) => {
            warn!("Búsqueda fallida para '{}': {:?}", query, e);
            format!("❌ {}", e)
        }
    };
    edit(ctx, command, content).await
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    orchestrator: &Arc<Orchestrator>,
    guild_id: GuildId,
) -> Result<()> {
    let Some(voice_channel) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return reply(ctx, command, "❌ Debes estar en un canal de voz", true).await;
    };

    command.defer(&ctx.http).await?;
    let volume_pct = bot.storage.lock().await.volume(guild_id.get());
    let content = match orchestrator
        .join(guild_id, voice_channel, command.channel_id, volume_pct)
        .await
    {
        Ok(true) => format!("✅ Conectado a <#{}>", voice_channel),
        Ok(false) => "ℹ️ Ya estoy conectado a un canal de voz".to_string(),
        Err(e) => error_reply(&e),
    };
    edit(ctx, command, content).await
}

async fn handle_volume(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    orchestrator: &Arc<Orchestrator>,
    guild_id: GuildId,
) -> Result<()> {
    let level = int_option(command, "level");
    let change = int_option(command, "change");
    let stored = bot.storage.lock().await.volume(guild_id.get());

    let result = match (level, change) {
        (Some(level), _) => orchestrator.set_volume(guild_id, level.clamp(0, 100) as i32).await,
        (None, Some(change)) => orchestrator.adjust_volume(guild_id, change.clamp(-100, 100) as i32).await,
        (None, None) => {
            let live = orchestrator.snapshot(guild_id).await.map(|s| s.volume_pct);
            let current = live.or(stored).unwrap_or(bot.config.default_volume);
            return reply(ctx, command, format!("🔊 Volumen actual: {}%", current), false).await;
        }
    };

    let (volume, content) = match result {
        Ok(volume) => (volume, format!("🔊 Volumen ajustado a {}%", volume)),
        // Sin sesión solo se guarda la preferencia para el próximo /play
        Err(PlaybackError::NotConnected) => {
            let volume = volume_target(stored.unwrap_or(bot.config.default_volume), level, change);
            (volume, format!("🔊 Volumen guardado en {}%, se aplicará al reproducir", volume))
        }
        Err(e) => return reply(ctx, command, error_reply(&e), true).await,
    };

    if let Err(e) = bot.storage.lock().await.set_volume(guild_id.get(), volume).await {
        warn!("No se pudo guardar el volumen de guild {}: {:?}", guild_id, e);
    }
    reply(ctx, command, content, false).await
}

async fn handle_ping(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let gateway = shard_latency(ctx).await;
    let started = Instant::now();
    ctx.http.get_current_user().await?;
    reply(ctx, command, ping_reply(gateway, started.elapsed()), false).await
}

/// Último heartbeat medido por el shard que recibió el comando
async fn shard_latency(ctx: &Context) -> Option<Duration> {
    let shard_manager = ctx.data.read().await.get::<ShardManagerContainer>().cloned()?;
    let runners = shard_manager.runners.lock().await;
    runners.get(&ctx.shard_id).and_then(|runner| runner.latency)
}

// Respuestas

async fn reply(ctx: &Context, command: &CommandInteraction, content: impl Into<String>, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn edit(ctx: &Context, command: &CommandInteraction, content: impl Into<String>) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|option| option.name == name)
        .map(|option| &option.value)
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(CommandDataOptionValue::as_i64)
}

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(CommandDataOptionValue::as_str)
}

fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = ctx.cache.guild(guild_id)?;
    guild.voice_states.get(&user_id).and_then(|state| state.channel_id)
}

pub fn error_reply(error: &PlaybackError) -> String {
    match error {
        PlaybackError::NotConnected
        | PlaybackError::NothingPlaying
        | PlaybackError::AlreadyInProgress
        | PlaybackError::InvalidPosition(_) => {
            format!("ℹ️ {}", capitalize(&error.to_string()))
        }
        _ => format!("❌ {}", capitalize(&error.to_string())),
    }
}

pub fn play_reply(outcome: &PlayOutcome) -> String {
    let mut content = match (&outcome.started, outcome.accepted) {
        (_, 0) => "❌ La cola está llena".to_string(),
        (Some(item), 1) => format!("▶️ Reproduciendo **{}**", item.title),
        (Some(item), n) => format!("▶️ Reproduciendo **{}** (+{} en cola)", item.title, n - 1),
        (None, 1) => format!("➕ Agregado a la cola en la posición {}", outcome.position),
        (None, n) => format!("➕ {} canciones agregadas desde la posición {}", n, outcome.position),
    };
    if outcome.dropped > 0 && outcome.accepted > 0 {
        content.push_str(&format!("\n⚠️ {} canciones no entraron en la cola", outcome.dropped));
    }
    content
}

pub fn skip_reply(report: &SkipReport) -> String {
    let mut content = format!("⏭️ Saltadas {} de {}", report.skipped, report.requested);
    match (&report.now_playing, report.is_exhausted()) {
        (Some(item), _) => content.push_str(&format!(", ahora suena **{}**", item.title)),
        (None, true) => content.push_str(", la cola se terminó"),
        (None, false) => content.push_str(", no queda nada en cola"),
    }
    content
}

pub fn stop_reply(report: &StopReport) -> String {
    match (report.was_playing, report.cleared) {
        (false, 0) => "⏹️ No había nada sonando".to_string(),
        (_, 0) => "⏹️ Reproducción detenida".to_string(),
        (_, n) => format!("⏹️ Reproducción detenida, {} canciones eliminadas de la cola", n),
    }
}

pub fn queue_reply(snapshot: &GuildSnapshot, page: &QueuePage) -> String {
    let mut lines = Vec::new();
    match &snapshot.current {
        Some(item) => lines.push(format!("🎵 Sonando: **{}** [{}]", item.title, format_duration(item.duration_ms))),
        None => lines.push("🎵 No hay nada sonando".to_string()),
    }

    if page.items.is_empty() {
        lines.push("📭 La cola está vacía".to_string());
        return lines.join("\n");
    }

    for (offset, item) in page.items.iter().enumerate() {
        lines.push(format!(
            "`{}.` {} [{}]",
            page.first_position + offset,
            item.title,
            format_duration(item.duration_ms)
        ));
    }
    lines.push(format!(
        "Página {}/{} • {} canciones • {} en total",
        page.current_page,
        page.total_pages,
        page.total_items,
        humantime::format_duration(Duration::from_secs(snapshot.queue_duration.as_secs()))
    ));
    lines.join("\n")
}

pub fn search_reply(items: &[PlayableItem]) -> String {
    let mut lines = vec!["🔍 **Resultados**".to_string()];
    for (index, item) in items.iter().enumerate() {
        lines.push(format!(
            "`{}.` **{}** [{}] <{}>",
            index + 1,
            item.title,
            format_duration(item.duration_ms),
            item.uri
        ));
    }
    lines.push(format!("{} resultados • Usa /play para agregarlos a la cola", items.len()));
    lines.join("\n")
}

pub fn history_reply(items: &[PlayableItem]) -> String {
    if items.is_empty() {
        return "📜 Todavía no terminó ninguna canción".to_string();
    }
    let mut lines = vec!["📜 **Últimas canciones**".to_string()];
    for (index, item) in items.iter().enumerate() {
        lines.push(format!("`{}.` {} [{}]", index + 1, item.title, format_duration(item.duration_ms)));
    }
    lines.join("\n")
}

pub fn ping_reply(gateway: Option<Duration>, rest: Duration) -> String {
    let gateway = gateway.map_or_else(|| "sin medir".to_string(), |d| format!("{}ms", d.as_millis()));
    format!("🏓 Pong!\nGateway: {}\nAPI: {}ms", gateway, rest.as_millis())
}

/// Volumen final de `/volume` cuando no hay sesión que lo aplique
pub fn volume_target(current: u8, level: Option<i64>, change: Option<i64>) -> u8 {
    let target = match (level, change) {
        (Some(level), _) => level,
        (None, Some(change)) => i64::from(current) + change,
        (None, None) => i64::from(current),
    };
    target.clamp(0, 100) as u8
}

fn nowplaying_reply(snapshot: &GuildSnapshot) -> Result<String, PlaybackError> {
    let item = snapshot.current.as_ref().ok_or(PlaybackError::NothingPlaying)?;
    let mut content = now_playing_line(item, snapshot.volume_pct);
    if snapshot.phase == PlaybackPhase::Paused {
        content.push_str(" ⏸️");
    }
    if snapshot.loop_policy != LoopPolicy::Off {
        content.push_str(&format!("\n🔁 Loop: {}", snapshot.loop_policy));
    }
    if let Some(next) = snapshot.upcoming.first() {
        content.push_str(&format!("\n⏭️ Siguiente: **{}** ({} en cola)", next.title, snapshot.queue_len));
    }
    if snapshot.idle_armed {
        content.push_str("\n💤 Sin oyentes: me desconectaré pronto");
    }
    Ok(content)
}

fn help_text() -> String {
    [
        "🎵 **Comandos**",
        "`/play <query>` - Reproduce una canción, URL o playlist",
        "`/search <query>` - Busca canciones sin reproducirlas",
        "`/join` - Conecta el bot a tu canal de voz",
        "`/skip [amount]` - Salta una o varias canciones",
        "`/stop` - Detiene la música y limpia la cola",
        "`/loop [times]` - Repite la canción actual (0 desactiva)",
        "`/volume [level] [change]` - Muestra, fija o sube/baja el volumen",
        "`/pause` / `/resume` - Pausa o reanuda",
        "`/shuffle` - Mezcla la cola",
        "`/remove <position>` - Quita una canción de la cola",
        "`/queue [page]` - Muestra la cola",
        "`/history` - Últimas canciones reproducidas",
        "`/nowplaying` - Muestra la canción actual",
        "`/leave` - Desconecta el bot",
        "`/ping` - Latencia del bot",
    ]
    .join("\n")
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
