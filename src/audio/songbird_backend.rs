use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{HttpRequest, Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    backend::{AudioBackend, SessionHandle},
    events::{EventSender, OrchestratorEvent, TrackEndReason, TrackEnded},
    queue::{PlayableItem, TrackSource},
};
use crate::error::BackendError;

/// [`AudioBackend`] sobre el driver de voz de songbird.
///
/// Cada `play` reemplaza el track del guild y registra los handlers de fin
/// y error con la generación recibida.
pub struct SongbirdBackend {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
    events: EventSender,
}

impl SongbirdBackend {
    pub fn new(songbird: Arc<Songbird>, events: EventSender) -> Self {
        Self {
            songbird,
            http: reqwest::Client::new(),
            tracks: DashMap::new(),
            events,
        }
    }

    fn input_for(&self, item: &PlayableItem) -> Input {
        match item.source {
            TrackSource::Direct => HttpRequest::new(self.http.clone(), item.uri.clone()).into(),
            _ => YoutubeDl::new(self.http.clone(), item.uri.clone()).into(),
        }
    }

    fn track(&self, guild_id: GuildId) -> Result<TrackHandle, BackendError> {
        self.tracks
            .get(&guild_id)
            .map(|track| track.clone())
            .ok_or(BackendError::NoSession(guild_id))
    }
}

#[async_trait]
impl AudioBackend for SongbirdBackend {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<SessionHandle, BackendError> {
        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|e| BackendError::Failed(format!("no se pudo unir al canal de voz: {}", e)))?;

        if let Err(e) = call.lock().await.deafen(true).await {
            warn!("No se pudo ensordecer al bot en guild {}: {}", guild_id, e);
        }

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);
        Ok(SessionHandle { guild_id, channel_id })
    }

    async fn play(
        &self,
        session: &SessionHandle,
        item: &PlayableItem,
        volume_pct: u8,
        generation: u64,
    ) -> Result<(), BackendError> {
        let call = self
            .songbird
            .get(session.guild_id)
            .ok_or(BackendError::NoSession(session.guild_id))?;

        let input = self.input_for(item);
        let track = call.lock().await.play_only_input(input);

        let volume = f32::from(volume_pct) / 100.0;
        track
            .set_volume(volume)
            .map_err(|e| BackendError::Failed(format!("no se pudo ajustar el volumen: {}", e)))?;

        for event in [TrackEvent::End, TrackEvent::Error] {
            let notifier = TrackEndNotifier {
                guild_id: session.guild_id,
                generation,
                events: self.events.clone(),
            };
            track
                .add_event(Event::Track(event), notifier)
                .map_err(|e| BackendError::Failed(format!("error al registrar handler: {}", e)))?;
        }

        debug!("▶️ Track {} en guild {} (generación {})", item.title, session.guild_id, generation);
        self.tracks.insert(session.guild_id, track);
        Ok(())
    }

    async fn stop(&self, session: &SessionHandle) -> Result<(), BackendError> {
        if let Some((_, track)) = self.tracks.remove(&session.guild_id) {
            // El track pudo haber terminado ya por su cuenta
            if let Err(e) = track.stop() {
                debug!("Stop sobre track finalizado en guild {}: {}", session.guild_id, e);
            }
        }
        Ok(())
    }

    async fn pause(&self, session: &SessionHandle, paused: bool) -> Result<(), BackendError> {
        let track = self.track(session.guild_id)?;
        let result = if paused { track.pause() } else { track.play() };
        result.map_err(|e| BackendError::Failed(e.to_string()))
    }

    async fn set_volume(&self, session: &SessionHandle, volume_pct: u8) -> Result<(), BackendError> {
        let track = self.track(session.guild_id)?;
        track
            .set_volume(f32::from(volume_pct) / 100.0)
            .map_err(|e| BackendError::Failed(e.to_string()))
    }

    async fn disconnect(&self, session: &SessionHandle) -> Result<(), BackendError> {
        self.tracks.remove(&session.guild_id);
        self.songbird
            .remove(session.guild_id)
            .await
            .map_err(|e| BackendError::Failed(format!("error al salir del canal: {}", e)))?;
        info!("👋 Sesión de voz cerrada en guild {}", session.guild_id);
        Ok(())
    }
}

/// Traduce los eventos de songbird a [`TrackEnded`]
struct TrackEndNotifier {
    guild_id: GuildId,
    generation: u64,
    events: EventSender,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(tracks) = ctx else {
            return None;
        };

        for (state, _) in tracks.iter() {
            let reason = end_reason(&state.playing);
            debug!(
                "🏁 Fin de track en guild {} ({:?}, generación {})",
                self.guild_id, reason, self.generation
            );
            let ended = TrackEnded {
                guild_id: self.guild_id,
                generation: self.generation,
                reason,
            };
            if self.events.send(OrchestratorEvent::TrackEnded(ended)).is_err() {
                warn!("Canal de eventos cerrado, fin de track descartado");
            }
        }
        None
    }
}

fn end_reason(mode: &PlayMode) -> TrackEndReason {
    match mode {
        PlayMode::Errored(_) => TrackEndReason::Errored,
        PlayMode::Stop => TrackEndReason::Stopped,
        _ => TrackEndReason::Finished,
    }
}
