use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    announcer::Announcer,
    backend::{AudioBackend, SessionHandle},
    chat::ChatPlatform,
    events::{EventReceiver, EventSender, OrchestratorEvent, TrackEndReason, TrackEnded},
    idle::IdleMonitor,
    queue::{PlayableItem, QueuePage},
    retry::{RetryGate, RetryPolicy},
    state::{AdvanceStep, GuildPlaybackState, LoopPolicy, PlaybackPhase},
};
use crate::{config::Config, error::PlaybackError};

/// Ajustes del orquestador derivados de [`Config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub default_volume: u8,
    pub max_queue_size: usize,
    pub idle_timeout: Duration,
    /// Desconectar si no quedan oyentes humanos al expirar el timer
    pub idle_when_alone: bool,
    /// Desconectar si no hay nada sonando ni en cola al expirar el timer
    pub idle_when_drained: bool,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_volume: 50,
            max_queue_size: 100,
            idle_timeout: Duration::from_secs(180),
            idle_when_alone: true,
            idle_when_drained: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_volume: config.default_volume,
            max_queue_size: config.max_queue_size,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            idle_when_alone: config.idle_when_alone,
            idle_when_drained: config.idle_when_drained,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub guild_id: GuildId,
    pub voice_channel: ChannelId,
    pub text_channel: ChannelId,
    pub items: Vec<PlayableItem>,
    /// Volumen inicial, solo se usa si el guild aún no tiene estado
    pub volume_pct: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayOutcome {
    /// Item que empezó a sonar como resultado de esta petición
    pub started: Option<PlayableItem>,
    pub accepted: usize,
    /// Items descartados por superar `max_queue_size`
    pub dropped: usize,
    /// Posición (1-based) en la cola del primer item aceptado
    pub position: usize,
}

/// Result of a skip. Asking for more than exists is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReport {
    pub requested: usize,
    pub skipped: usize,
    pub now_playing: Option<PlayableItem>,
}

impl SkipReport {
    pub fn is_exhausted(&self) -> bool {
        self.skipped < self.requested
    }
}

impl fmt::Display for SkipReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped {} of {} requested", self.skipped, self.requested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub cleared: usize,
    pub was_playing: bool,
}

/// What an advance ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Replayed(PlayableItem),
    Started(PlayableItem),
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSnapshot {
    pub phase: PlaybackPhase,
    pub connected: bool,
    pub current: Option<PlayableItem>,
    pub upcoming: Vec<PlayableItem>,
    pub queue_len: usize,
    pub queue_duration: Duration,
    pub loop_policy: LoopPolicy,
    pub volume_pct: u8,
    pub idle_armed: bool,
}

struct GuildSlot {
    state: Arc<Mutex<GuildPlaybackState>>,
    /// Solo un skip a la vez; los demás fallan de inmediato
    skip_gate: Mutex<()>,
    /// Generación del estado, legible sin tomar el lock
    generation: Arc<AtomicU64>,
}

impl GuildSlot {
    fn new(state: GuildPlaybackState) -> Self {
        Self {
            generation: state.generation_counter(),
            state: Arc::new(Mutex::new(state)),
            skip_gate: Mutex::new(()),
        }
    }
}

type LockedGuild = (Arc<GuildSlot>, OwnedMutexGuard<GuildPlaybackState>);

/// Per-guild playback state machine.
///
/// Every operation, backend callback, presence change and idle expiry for a
/// guild goes through that guild's lock. The lock covers the in-memory
/// mutation plus at most one play/stop dispatch; connecting and chat
/// announcements happen outside of it. Every play dispatch and every
/// explicit stop/skip bumps the guild's generation, so track-end events
/// from superseded plays are recognised and dropped.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    backend: Arc<dyn AudioBackend>,
    chat: Arc<dyn ChatPlatform>,
    announcer: Announcer,
    idle: IdleMonitor,
    gate: RetryGate,
    guilds: DashMap<GuildId, Arc<GuildSlot>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        backend: Arc<dyn AudioBackend>,
        chat: Arc<dyn ChatPlatform>,
        events: EventSender,
    ) -> Self {
        let gate = RetryGate::new(settings.retry);
        info!(
            "🎛️ Orquestador listo (volumen {}%, cola máx {}, inactividad {:?})",
            settings.default_volume, settings.max_queue_size, settings.idle_timeout
        );

        Self {
            settings,
            backend,
            announcer: Announcer::new(Arc::clone(&chat), gate),
            chat,
            idle: IdleMonitor::new(events),
            gate,
            guilds: DashMap::new(),
        }
    }

    /// Consume eventos del backend y de los timers hasta que se cierre el canal.
    ///
    /// Cada evento corre en su propia tarea para que guilds distintos no se
    /// bloqueen entre sí; el orden dentro de un guild lo impone su lock.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: EventReceiver) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move { orchestrator.handle_event(event).await });
            }
            info!("📪 Canal de eventos cerrado");
        })
    }

    pub async fn handle_event(&self, event: OrchestratorEvent) {
        let result = match event {
            OrchestratorEvent::TrackEnded(ended) => self.on_track_ended(ended).await.map(|_| ()),
            OrchestratorEvent::IdleExpired { guild_id, timer_id } => {
                self.on_idle_expired(guild_id, timer_id).await.map(|_| ())
            }
            OrchestratorEvent::PresenceChanged { guild_id } => self.on_voice_presence_changed(guild_id).await,
        };

        match result {
            Ok(()) => {}
            Err(e @ PlaybackError::StaleEvent { .. }) => debug!("🗑️ Descartado: {}", e),
            Err(e) => warn!("Error procesando evento: {}", e),
        }
    }

    /// Enqueues items, connecting and starting playback when needed.
    pub async fn play(&self, request: PlayRequest) -> Result<PlayOutcome, PlaybackError> {
        let PlayRequest {
            guild_id,
            voice_channel,
            text_channel,
            items,
            volume_pct,
        } = request;

        if items.is_empty() {
            return Ok(PlayOutcome::default());
        }

        let volume = volume_pct.unwrap_or(self.settings.default_volume);
        let (slot, mut state) = self.lock_or_create(guild_id, volume).await;
        state.text_channel = Some(text_channel);

        let accepted = items.len().min(state.queue.remaining_capacity());
        let mut outcome = PlayOutcome {
            started: None,
            accepted,
            dropped: items.len() - accepted,
            position: state.queue.len() + 1,
        };
        for item in items.into_iter().take(accepted) {
            state.queue.push(item);
        }
        if outcome.dropped > 0 {
            warn!("📦 Cola llena en guild {}: {} items descartados", guild_id, outcome.dropped);
        }

        let session = state.session;
        let advance = match session {
            None if state.phase == PlaybackPhase::Connecting => return Ok(outcome),
            None => {
                state.phase = PlaybackPhase::Connecting;
                drop(state);
                state = self.connect(&slot, guild_id, voice_channel).await?;
                match self.start_after_connect(&mut state).await? {
                    Some(advance) => advance,
                    None => return Ok(outcome),
                }
            }
            Some(_) if state.current.is_some() => return Ok(outcome),
            Some(_) => {
                let step = state.select_next();
                self.dispatch(&mut state, step).await?
            }
        };
        let volume = state.volume_pct;
        drop(state);

        if let Advance::Started(item) = &advance {
            outcome.started = Some(item.clone());
        }
        self.announce(guild_id, Some(text_channel), volume, &advance).await;
        Ok(outcome)
    }

    /// Connects without queueing anything. Returns `false` when the guild
    /// already has (or is opening) a session.
    pub async fn join(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: ChannelId,
        volume_pct: Option<u8>,
    ) -> Result<bool, PlaybackError> {
        let volume = volume_pct.unwrap_or(self.settings.default_volume);
        let (slot, mut state) = self.lock_or_create(guild_id, volume).await;
        state.text_channel = Some(text_channel);
        if state.session.is_some() || state.phase == PlaybackPhase::Connecting {
            return Ok(false);
        }

        state.phase = PlaybackPhase::Connecting;
        drop(state);
        let mut state = self.connect(&slot, guild_id, voice_channel).await?;

        // Un /play pudo encolar mientras conectábamos
        let advance = self.start_after_connect(&mut state).await?;
        let volume = state.volume_pct;
        drop(state);

        if let Some(advance) = advance {
            self.announce(guild_id, Some(text_channel), volume, &advance).await;
        }
        Ok(true)
    }

    /// Skips the current item plus up to `count - 1` queued ones.
    pub async fn skip(&self, guild_id: GuildId, count: usize) -> Result<SkipReport, PlaybackError> {
        let requested = count.max(1);
        let slot = self.slot(guild_id).ok_or(PlaybackError::NotConnected)?;
        // Lo que sonaba cuando llegó el pedido
        let target = slot.generation.load(Ordering::SeqCst);
        let _in_progress = slot.skip_gate.try_lock().map_err(|_| {
            debug!("⛔ Skip rechazado en guild {}: otro skip en curso", guild_id);
            PlaybackError::AlreadyInProgress
        })?;

        let mut state = slot.state.lock().await;
        if state.retired {
            return Err(PlaybackError::NotConnected);
        }
        let session = state.session.ok_or(PlaybackError::NotConnected)?;
        if state.current.is_none() || !matches!(state.phase, PlaybackPhase::Playing | PlaybackPhase::Paused) {
            return Err(PlaybackError::NothingPlaying);
        }
        if state.generation() != target {
            debug!("⛔ Skip rechazado en guild {}: la canción cambió mientras esperaba", guild_id);
            return Err(PlaybackError::AlreadyInProgress);
        }

        self.gate
            .run("stop", || self.backend.stop(&session))
            .await
            .map_err(|e| PlaybackError::BackendUnavailable(e.to_string()))?;

        state.bump_generation();
        state.loop_policy = LoopPolicy::Off;
        let skipped = 1 + state.queue.discard_front(requested - 1);
        info!("⏭️ Saltadas {} de {} canciones en guild {}", skipped, requested, guild_id);

        let step = state.select_next();
        let result = self.dispatch(&mut state, step).await;
        let (channel, volume) = (state.text_channel, state.volume_pct);
        drop(state);

        let advance = match result {
            Ok(advance) => advance,
            Err(e) => {
                self.announcer.retire_previous(guild_id).await;
                return Err(e);
            }
        };
        self.announce(guild_id, channel, volume, &advance).await;

        let now_playing = match advance {
            Advance::Started(item) | Advance::Replayed(item) => Some(item),
            Advance::Drained => None,
        };
        Ok(SkipReport {
            requested,
            skipped,
            now_playing,
        })
    }

    /// Clears the queue and silences the session; the session stays connected.
    pub async fn stop(&self, guild_id: GuildId) -> Result<StopReport, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        let Some(session) = state.session else {
            if state.phase != PlaybackPhase::Connecting {
                return Err(PlaybackError::NotConnected);
            }
            // Aún conectando: sin cola, la conexión no arranca nada
            state.bump_generation();
            state.loop_policy = LoopPolicy::Off;
            let cleared = state.queue.clear();
            info!("⏹️ Cola vaciada durante la conexión en guild {}", guild_id);
            return Ok(StopReport {
                cleared,
                was_playing: false,
            });
        };

        let was_playing = state.current.is_some();
        if was_playing {
            self.gate
                .run("stop", || self.backend.stop(&session))
                .await
                .map_err(|e| PlaybackError::BackendUnavailable(e.to_string()))?;
        }

        state.bump_generation();
        let cleared = state.queue.clear();
        state.loop_policy = LoopPolicy::Off;
        state.retire_current();
        state.phase = PlaybackPhase::Idle;
        if !state.is_idle_armed() {
            self.arm_idle(&mut state);
        }
        drop(state);

        info!("⏹️ Reproducción detenida en guild {}", guild_id);
        self.announcer.retire_previous(guild_id).await;
        Ok(StopReport { cleared, was_playing })
    }

    pub async fn set_loop(&self, guild_id: GuildId, policy: LoopPolicy) -> Result<LoopPolicy, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        if state.current.is_none() {
            return Err(PlaybackError::NothingPlaying);
        }

        state.loop_policy = policy.normalized();
        info!("🔁 Loop en guild {}: {}", guild_id, state.loop_policy);
        Ok(state.loop_policy)
    }

    /// Clamps to [0, 100] and forwards to the backend when a track is live.
    pub async fn set_volume(&self, guild_id: GuildId, volume_pct: i32) -> Result<u8, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        self.apply_volume(&mut state, volume_pct).await
    }

    /// Sube o baja el volumen actual (`/volume change`)
    pub async fn adjust_volume(&self, guild_id: GuildId, delta: i32) -> Result<u8, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        let target = i32::from(state.volume_pct) + delta;
        self.apply_volume(&mut state, target).await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<bool, PlaybackError> {
        self.set_paused(guild_id, true).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<bool, PlaybackError> {
        self.set_paused(guild_id, false).await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> Result<usize, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        state.queue.shuffle();
        Ok(state.queue.len())
    }

    /// Quita de la cola el item en `position` (1-based)
    pub async fn remove(&self, guild_id: GuildId, position: usize) -> Result<PlayableItem, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        let removed = state
            .queue
            .remove(position)
            .ok_or(PlaybackError::InvalidPosition(position))?;
        info!("➖ {} quitado de la cola en guild {}", removed.title, guild_id);
        Ok(removed)
    }

    /// Lo último que sonó, el más reciente primero
    pub async fn history(&self, guild_id: GuildId, limit: usize) -> Option<Vec<PlayableItem>> {
        let (_, state) = self.lock_existing(guild_id).await?;
        Some(state.recent_history(limit))
    }

    /// Explicit disconnect; destroys the guild's state.
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        let (slot, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        self.teardown(&slot, &mut state).await;
        drop(state);

        self.announcer.retire_previous(guild_id).await;
        info!("👋 Desconectado del guild {}", guild_id);
        Ok(())
    }

    /// Desconecta todos los guilds (apagado ordenado)
    pub async fn disconnect_all(&self) {
        let guild_ids: Vec<GuildId> = self.guilds.iter().map(|entry| *entry.key()).collect();
        let results = join_all(guild_ids.iter().map(|guild_id| self.leave(*guild_id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!("🔌 {} sesiones cerradas ({} ya no existían)", guild_ids.len() - failed, failed);
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Option<GuildSnapshot> {
        let (_, state) = self.lock_existing(guild_id).await?;
        Some(GuildSnapshot {
            phase: state.phase,
            connected: state.session.is_some(),
            current: state.current.clone(),
            upcoming: state.queue.peek_range(10),
            queue_len: state.queue.len(),
            queue_duration: state.queue.total_duration(),
            loop_policy: state.loop_policy,
            volume_pct: state.volume_pct,
            idle_armed: state.is_idle_armed(),
        })
    }

    pub async fn queue_page(&self, guild_id: GuildId, page: usize, per_page: usize) -> Option<QueuePage> {
        let (_, state) = self.lock_existing(guild_id).await?;
        Some(state.queue.page(page, per_page))
    }

    pub fn active_guilds(&self) -> usize {
        self.guilds.len()
    }

    #[cfg(test)]
    async fn generation(&self, guild_id: GuildId) -> Option<u64> {
        let (_, state) = self.lock_existing(guild_id).await?;
        Some(state.generation())
    }

    /// Backend callback: advances unless the event was superseded.
    pub async fn on_track_ended(&self, ended: TrackEnded) -> Result<Advance, PlaybackError> {
        let TrackEnded {
            guild_id,
            generation,
            reason,
        } = ended;
        let stale = |current| PlaybackError::StaleEvent {
            guild_id,
            received: generation,
            current,
        };

        let (_, mut state) = self.lock_existing(guild_id).await.ok_or_else(|| stale(None))?;
        if state.generation() != generation || state.current.is_none() {
            return Err(stale(Some(state.generation())));
        }

        if reason == TrackEndReason::Errored {
            warn!("⚠️ Track con error en guild {}, se desactiva el loop", guild_id);
            state.loop_policy = LoopPolicy::Off;
        }

        let step = state.select_next();
        let result = self.dispatch(&mut state, step).await;
        let (channel, volume) = (state.text_channel, state.volume_pct);
        drop(state);

        match &result {
            Ok(advance) => self.announce(guild_id, channel, volume, advance).await,
            Err(e) => {
                self.announcer.retire_previous(guild_id).await;
                if let Some(channel) = channel {
                    self.announcer.notice(channel, format!("❌ No se pudo continuar: {}", e)).await;
                }
            }
        }
        result
    }

    /// Arms the idle timer when the channel empties, cancels it when
    /// listeners come back to something that is playing.
    pub async fn on_voice_presence_changed(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        let Some(session) = self.session_of(guild_id).await else {
            return Ok(());
        };
        let listeners = match self.listeners(&session).await {
            Some(listeners) => listeners,
            None => return Ok(()),
        };

        let Some((_, mut state)) = self.lock_existing(guild_id).await else {
            return Ok(());
        };
        if state.session != Some(session) {
            return Ok(());
        }

        if listeners.is_empty() {
            if self.settings.idle_when_alone && !state.is_idle_armed() {
                info!("🚪 Canal vacío en guild {}, programando desconexión", guild_id);
                self.arm_idle(&mut state);
            }
        } else if state.current.is_some() && state.is_idle_armed() {
            info!("👥 Oyentes de vuelta en guild {}, desconexión cancelada", guild_id);
            state.idle_timer = None;
        }
        Ok(())
    }

    /// Timer callback. Returns whether the session was torn down.
    pub async fn on_idle_expired(&self, guild_id: GuildId, timer_id: u64) -> Result<bool, PlaybackError> {
        let stale = |current| PlaybackError::StaleEvent {
            guild_id,
            received: timer_id,
            current,
        };

        let session = {
            let (_, state) = self.lock_existing(guild_id).await.ok_or_else(|| stale(None))?;
            if state.armed_timer_id() != Some(timer_id) {
                return Err(stale(state.armed_timer_id()));
            }
            state.session
        };

        let listeners = match session {
            Some(session) if self.settings.idle_when_alone => self.listeners(&session).await,
            _ => None,
        };

        let (slot, mut state) = self.lock_existing(guild_id).await.ok_or_else(|| stale(None))?;
        // Un play/cancel pudo llegar mientras consultábamos la presencia
        if state.armed_timer_id() != Some(timer_id) {
            return Err(stale(state.armed_timer_id()));
        }
        state.idle_timer = None;

        let alone = self.settings.idle_when_alone && listeners.is_some_and(|l| l.is_empty());
        let drained = self.settings.idle_when_drained && state.is_drained();
        if !alone && !drained {
            debug!("💤 Timer expiró en guild {} pero la sesión sigue en uso", guild_id);
            return Ok(false);
        }

        let channel = state.text_channel;
        self.teardown(&slot, &mut state).await;
        drop(state);

        info!(
            "⏰ Desconectado por inactividad en guild {} (sin oyentes: {}, sin música: {})",
            guild_id, alone, drained
        );
        self.announcer.retire_previous(guild_id).await;
        if let Some(channel) = channel {
            let reason = if alone { "no quedan oyentes" } else { "no hay música en cola" };
            let minutes = self.settings.idle_timeout.as_secs() / 60;
            self.announcer
                .notice(channel, format!("👋 Salí del canal de voz: {} desde hace {} minutos", reason, minutes))
                .await;
        }
        Ok(true)
    }

    // Funciones privadas

    fn slot(&self, guild_id: GuildId) -> Option<Arc<GuildSlot>> {
        self.guilds.get(&guild_id).map(|slot| Arc::clone(&slot))
    }

    async fn lock_existing(&self, guild_id: GuildId) -> Option<LockedGuild> {
        loop {
            let slot = self.slot(guild_id)?;
            let state = Arc::clone(&slot.state).lock_owned().await;
            if !state.retired {
                return Some((slot, state));
            }
        }
    }

    async fn lock_or_create(&self, guild_id: GuildId, volume_pct: u8) -> LockedGuild {
        loop {
            let slot = self
                .guilds
                .entry(guild_id)
                .or_insert_with(|| {
                    debug!("🆕 Estado creado para guild {}", guild_id);
                    Arc::new(GuildSlot::new(GuildPlaybackState::new(
                        guild_id,
                        volume_pct,
                        self.settings.max_queue_size,
                    )))
                })
                .clone();
            let state = Arc::clone(&slot.state).lock_owned().await;
            if !state.retired {
                return (slot, state);
            }
        }
    }

    async fn session_of(&self, guild_id: GuildId) -> Option<SessionHandle> {
        let (_, state) = self.lock_existing(guild_id).await?;
        state.session
    }

    async fn listeners(&self, session: &SessionHandle) -> Option<HashSet<UserId>> {
        match self
            .gate
            .run("voice_presence", || self.chat.voice_presence(session.guild_id, session.channel_id))
            .await
        {
            Ok(listeners) => Some(listeners),
            Err(e) => {
                warn!("No se pudo consultar la presencia en guild {}: {}", session.guild_id, e);
                None
            }
        }
    }

    /// Connects outside the guild lock; the `Connecting` phase keeps other
    /// requests from starting a second connection meanwhile.
    async fn connect(
        &self,
        slot: &Arc<GuildSlot>,
        guild_id: GuildId,
        voice_channel: ChannelId,
    ) -> Result<OwnedMutexGuard<GuildPlaybackState>, PlaybackError> {
        info!("🔗 Conectando al canal {} en guild {}", voice_channel, guild_id);
        let connected = self
            .gate
            .run("connect", || self.backend.connect(guild_id, voice_channel))
            .await;

        let mut state = Arc::clone(&slot.state).lock_owned().await;
        if state.retired {
            // Alguien hizo leave mientras conectábamos
            if let Ok(session) = connected {
                if let Err(e) = self.backend.disconnect(&session).await {
                    warn!("No se pudo cerrar la sesión huérfana en guild {}: {}", guild_id, e);
                }
            }
            return Err(PlaybackError::NotConnected);
        }

        match connected {
            Ok(session) => {
                info!("✅ Conectado al canal {} en guild {}", voice_channel, guild_id);
                state.session = Some(session);
                state.phase = PlaybackPhase::Idle;
                Ok(state)
            }
            Err(e) => {
                error!("❌ Error al conectar en guild {}: {}", guild_id, e);
                self.teardown(slot, &mut state).await;
                Err(PlaybackError::BackendUnavailable(e.to_string()))
            }
        }
    }

    /// Arranca lo que haya en cola tras conectar. Si un `/stop` vació la cola
    /// mientras tanto, solo deja armado el timer de inactividad.
    async fn start_after_connect(&self, state: &mut GuildPlaybackState) -> Result<Option<Advance>, PlaybackError> {
        if state.queue.is_empty() {
            debug!("🔇 Conectado sin nada en cola en guild {}", state.guild_id);
            self.arm_idle(state);
            return Ok(None);
        }
        let step = state.select_next();
        self.dispatch(state, step).await.map(Some)
    }

    /// Dispatches `play` for the selected item, or goes idle when the queue
    /// is drained. A failed play puts the item back at
    /// the queue front and leaves the guild silent.
    async fn dispatch(&self, state: &mut GuildPlaybackState, step: AdvanceStep) -> Result<Advance, PlaybackError> {
        let (item, replay) = match step {
            AdvanceStep::Drained => {
                info!("📭 Cola vacía en guild {}", state.guild_id);
                state.phase = PlaybackPhase::Idle;
                self.arm_idle(state);
                return Ok(Advance::Drained);
            }
            AdvanceStep::Replay(item) => (item, true),
            AdvanceStep::Next(item) => (item, false),
        };

        let Some(session) = state.session else {
            state.current = None;
            state.queue.push_front(item);
            state.phase = PlaybackPhase::Idle;
            return Err(PlaybackError::NotConnected);
        };

        let generation = state.bump_generation();
        let volume = state.volume_pct;
        let played = self
            .gate
            .run("play", || self.backend.play(&session, &item, volume, generation))
            .await;

        match played {
            Ok(()) => {
                state.phase = PlaybackPhase::Playing;
                state.idle_timer = None;
                if replay {
                    info!("🔂 Repitiendo: {} (loop {})", item.title, state.loop_policy);
                    Ok(Advance::Replayed(item))
                } else {
                    info!("🎵 Reproduciendo: {} en guild {}", item.title, state.guild_id);
                    Ok(Advance::Started(item))
                }
            }
            Err(e) => {
                error!("❌ Error al reproducir {} en guild {}: {}", item.title, state.guild_id, e);
                state.current = None;
                state.loop_policy = LoopPolicy::Off;
                state.queue.push_front(item);
                state.phase = PlaybackPhase::Idle;
                self.arm_idle(state);
                Err(PlaybackError::BackendUnavailable(e.to_string()))
            }
        }
    }

    async fn apply_volume(&self, state: &mut GuildPlaybackState, volume_pct: i32) -> Result<u8, PlaybackError> {
        let volume = volume_pct.clamp(0, 100) as u8;

        if let (Some(session), Some(_)) = (state.session, state.current.as_ref()) {
            self.gate
                .run("set_volume", || self.backend.set_volume(&session, volume))
                .await
                .map_err(|e| PlaybackError::BackendUnavailable(e.to_string()))?;
        }

        state.volume_pct = volume;
        info!("🔊 Volumen ajustado a {}% en guild {}", volume, state.guild_id);
        Ok(volume)
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> Result<bool, PlaybackError> {
        let (_, mut state) = self.lock_existing(guild_id).await.ok_or(PlaybackError::NotConnected)?;
        let session = state.session.ok_or(PlaybackError::NotConnected)?;
        if state.current.is_none() {
            return Err(PlaybackError::NothingPlaying);
        }

        let (from, to) = if paused {
            (PlaybackPhase::Playing, PlaybackPhase::Paused)
        } else {
            (PlaybackPhase::Paused, PlaybackPhase::Playing)
        };
        if state.phase != from {
            return Ok(false);
        }

        self.gate
            .run("pause", || self.backend.pause(&session, paused))
            .await
            .map_err(|e| PlaybackError::BackendUnavailable(e.to_string()))?;
        state.phase = to;
        info!("{} en guild {}", if paused { "⏸️ Pausado" } else { "▶️ Reanudado" }, guild_id);
        Ok(true)
    }

    fn arm_idle(&self, state: &mut GuildPlaybackState) {
        if !self.settings.idle_when_alone && !self.settings.idle_when_drained {
            return;
        }
        state.idle_timer = Some(self.idle.arm(state.guild_id, self.settings.idle_timeout));
    }

    /// Destroys the guild entry. Must be called with the guild lock held.
    async fn teardown(&self, slot: &Arc<GuildSlot>, state: &mut GuildPlaybackState) {
        state.bump_generation();
        state.retired = true;
        state.idle_timer = None;
        state.queue.clear();
        state.current = None;
        state.loop_policy = LoopPolicy::Off;
        state.phase = PlaybackPhase::Idle;
        self.guilds.remove_if(&state.guild_id, |_, existing| Arc::ptr_eq(existing, slot));

        if let Some(session) = state.session.take() {
            if let Err(e) = self.gate.run("disconnect", || self.backend.disconnect(&session)).await {
                warn!("Error al desconectar guild {}: {}", state.guild_id, e);
            }
        }
    }

    async fn announce(&self, guild_id: GuildId, channel: Option<ChannelId>, volume_pct: u8, advance: &Advance) {
        let Some(channel) = channel else {
            return;
        };

        match advance {
            Advance::Started(item) => self.announcer.now_playing(guild_id, channel, item, volume_pct).await,
            Advance::Replayed(_) => {}
            Advance::Drained => {
                self.announcer.retire_previous(guild_id).await;
                self.announcer
                    .notice(channel, "📭 La cola terminó. Usa /play para seguir escuchando".to_string())
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        events,
        state::LoopCount,
        testing::{item, BackendCall, FakeBackend, FakeChat},
    };
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(1);
    const VOICE: ChannelId = ChannelId::new(20);
    const TEXT: ChannelId = ChannelId::new(30);

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        backend: Arc<FakeBackend>,
        chat: Arc<FakeChat>,
        events: EventReceiver,
    }

    fn harness(settings: OrchestratorSettings) -> Harness {
        let (tx, rx) = events::channel();
        let backend = Arc::new(FakeBackend::default());
        let chat = Arc::new(FakeChat::with_listeners([UserId::new(99)]));
        let orchestrator = Arc::new(Orchestrator::new(
            settings,
            Arc::clone(&backend) as Arc<dyn AudioBackend>,
            Arc::clone(&chat) as Arc<dyn ChatPlatform>,
            tx,
        ));
        Harness {
            orchestrator,
            backend,
            chat,
            events: rx,
        }
    }

    fn request(titles: &[&str]) -> PlayRequest {
        PlayRequest {
            guild_id: GUILD,
            voice_channel: VOICE,
            text_channel: TEXT,
            items: titles.iter().map(|t| item(t)).collect(),
            volume_pct: None,
        }
    }

    async fn generation(h: &Harness) -> u64 {
        h.orchestrator.generation(GUILD).await.unwrap_or_default()
    }

    fn ended(generation: u64) -> TrackEnded {
        TrackEnded {
            guild_id: GUILD,
            generation,
            reason: TrackEndReason::Finished,
        }
    }

    fn titles(items: &[PlayableItem]) -> Vec<&str> {
        items.iter().map(|i| i.title.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_play_connects_and_starts() {
        let h = harness(OrchestratorSettings::default());

        let outcome = h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        assert_eq!(outcome.started, Some(item("c")));
        assert_eq!(outcome.accepted, 3);
        assert_eq!(
            h.backend.calls(),
            vec![
                BackendCall::Connect(VOICE),
                BackendCall::Play {
                    title: "c".into(),
                    volume: 50,
                    generation: 1
                },
            ]
        );
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.phase, PlaybackPhase::Playing);
        assert_eq!(titles(&snapshot.upcoming), vec!["a", "b"]);
        assert_eq!(h.chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_play_while_playing_only_enqueues() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();

        let outcome = h.orchestrator.play(request(&["a"])).await.unwrap();

        assert_eq!(outcome.started, None);
        assert_eq!(outcome.position, 1);
        assert_eq!(h.backend.plays(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_queue_capacity_drops_excess() {
        let h = harness(OrchestratorSettings {
            max_queue_size: 2,
            ..OrchestratorSettings::default()
        });

        let outcome = h.orchestrator.play(request(&["a", "b", "c", "d"])).await.unwrap();

        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(outcome.started, Some(item("a")));
    }

    #[tokio::test]
    async fn test_skip_discards_stale_end_event() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();
        let before = generation(&h).await;

        let report = h.orchestrator.skip(GUILD, 1).await.unwrap();

        assert_eq!(report.now_playing, Some(item("a")));
        assert_eq!(report.skipped, 1);
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.current, Some(item("a")));
        assert_eq!(titles(&snapshot.upcoming), vec!["b"]);
        assert!(generation(&h).await > before);

        // El fin de "c" provocado por el stop llega tarde
        let late = h.orchestrator.on_track_ended(ended(before)).await;
        assert!(matches!(late, Err(PlaybackError::StaleEvent { .. })));
        assert_eq!(h.orchestrator.snapshot(GUILD).await.unwrap().current, Some(item("a")));
        assert_eq!(h.backend.plays(), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_skip_beyond_queue_reports_partial_count() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        let report = h.orchestrator.skip(GUILD, 5).await.unwrap();

        assert_eq!(report.skipped, 3);
        assert!(report.is_exhausted());
        assert_eq!(report.to_string(), "skipped 3 of 5 requested");
        assert_eq!(report.now_playing, None);
        assert!(h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);
    }

    #[tokio::test]
    async fn test_skip_requires_something_playing() {
        let h = harness(OrchestratorSettings::default());
        assert_eq!(h.orchestrator.skip(GUILD, 1).await, Err(PlaybackError::NotConnected));

        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();
        assert_eq!(h.orchestrator.skip(GUILD, 1).await, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test]
    async fn test_concurrent_skips_fail_fast() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        let (entered, release) = h.backend.hold_next_stop();
        let first = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.skip(GUILD, 1).await })
        };
        entered.notified().await;

        let second = h.orchestrator.skip(GUILD, 1).await;
        assert_eq!(second, Err(PlaybackError::AlreadyInProgress));

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.now_playing, Some(item("a")));
        assert_eq!(h.backend.plays(), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_interleaved_skips_and_events_never_double_advance() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["t0", "t1", "t2", "t3", "t4"])).await.unwrap();
        let mut accepted = 1;
        let mut stale_generations = Vec::new();

        for round in 0..4 {
            let current = generation(&h).await;
            if round % 2 == 0 {
                h.orchestrator.skip(GUILD, 1).await.unwrap();
                stale_generations.push(current);
            } else {
                h.orchestrator.on_track_ended(ended(current)).await.unwrap();
                stale_generations.push(current);
            }
            accepted += 1;

            // Todos los eventos viejos deben ser descartados
            for old in &stale_generations {
                assert!(h.orchestrator.on_track_ended(ended(*old)).await.is_err());
            }
        }

        assert_eq!(h.backend.plays().len(), accepted);
        assert_eq!(h.backend.plays(), vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn test_finite_loop_replays_before_advancing() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a"])).await.unwrap();

        let policy = h
            .orchestrator
            .set_loop(GUILD, LoopPolicy::Track(LoopCount::Finite(3)))
            .await
            .unwrap();
        assert_eq!(policy, LoopPolicy::Track(LoopCount::Finite(3)));

        for _ in 0..3 {
            let advance = h.orchestrator.on_track_ended(ended(generation(&h).await)).await.unwrap();
            assert_eq!(advance, Advance::Replayed(item("c")));
        }
        let advance = h.orchestrator.on_track_ended(ended(generation(&h).await)).await.unwrap();
        assert_eq!(advance, Advance::Started(item("a")));
        assert_eq!(h.backend.plays(), vec!["c", "c", "c", "c", "a"]);
    }

    #[tokio::test]
    async fn test_errored_track_is_not_looped() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a"])).await.unwrap();
        h.orchestrator
            .set_loop(GUILD, LoopPolicy::Track(LoopCount::Infinite))
            .await
            .unwrap();

        let advance = h
            .orchestrator
            .on_track_ended(TrackEnded {
                guild_id: GUILD,
                generation: generation(&h).await,
                reason: TrackEndReason::Errored,
            })
            .await
            .unwrap();

        assert_eq!(advance, Advance::Started(item("a")));
    }

    #[tokio::test]
    async fn test_loop_requires_current_item() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();

        let result = h
            .orchestrator
            .set_loop(GUILD, LoopPolicy::Track(LoopCount::Infinite))
            .await;
        assert_eq!(result, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        let first = h.orchestrator.stop(GUILD).await.unwrap();
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(first, StopReport { cleared: 2, was_playing: true });
        assert_eq!((snapshot.current, snapshot.queue_len), (None, 0));
        assert!(snapshot.connected);

        let second = h.orchestrator.stop(GUILD).await.unwrap();
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(second, StopReport { cleared: 0, was_playing: false });
        assert_eq!((snapshot.current, snapshot.queue_len), (None, 0));

        let stops = h.backend.calls().into_iter().filter(|c| *c == BackendCall::Stop).count();
        assert_eq!(stops, 1);
        let edits = h.chat.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].1, "✅ Reproducido: **c**");
    }

    #[tokio::test]
    async fn test_play_after_stop_reuses_session() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();

        let outcome = h.orchestrator.play(request(&["a"])).await.unwrap();

        assert_eq!(outcome.started, Some(item("a")));
        let connects = h
            .backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert!(!h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);
    }

    #[tokio::test]
    async fn test_volume_is_clamped_and_forwarded() {
        let h = harness(OrchestratorSettings::default());
        assert_eq!(h.orchestrator.set_volume(GUILD, 30).await, Err(PlaybackError::NotConnected));

        h.orchestrator.play(request(&["c"])).await.unwrap();
        assert_eq!(h.orchestrator.set_volume(GUILD, 150).await, Ok(100));
        assert_eq!(h.orchestrator.adjust_volume(GUILD, -10).await, Ok(90));
        assert_eq!(h.orchestrator.set_volume(GUILD, -5).await, Ok(0));

        assert!(h.backend.calls().contains(&BackendCall::SetVolume(90)));
        assert_eq!(h.orchestrator.snapshot(GUILD).await.unwrap().volume_pct, 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();

        assert_eq!(h.orchestrator.pause(GUILD).await, Ok(true));
        assert_eq!(h.orchestrator.pause(GUILD).await, Ok(false));
        assert_eq!(h.orchestrator.snapshot(GUILD).await.unwrap().phase, PlaybackPhase::Paused);
        assert_eq!(h.orchestrator.resume(GUILD).await, Ok(true));
        assert_eq!(h.orchestrator.snapshot(GUILD).await.unwrap().phase, PlaybackPhase::Playing);
    }

    #[tokio::test]
    async fn test_failed_play_keeps_item_queued() {
        let h = harness(OrchestratorSettings::default());
        h.backend.fail_plays(true);

        let result = h.orchestrator.play(request(&["c", "a"])).await;

        assert!(matches!(result, Err(PlaybackError::BackendUnavailable(_))));
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(snapshot.current, None);
        assert_eq!(titles(&snapshot.upcoming), vec!["c", "a"]);
        assert_eq!(snapshot.phase, PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_connect_destroys_state() {
        let h = harness(OrchestratorSettings::default());
        h.backend.fail_connects(true);

        let result = h.orchestrator.play(request(&["c"])).await;

        assert!(matches!(result, Err(PlaybackError::BackendUnavailable(_))));
        assert_eq!(h.orchestrator.active_guilds(), 0);
    }

    #[tokio::test]
    async fn test_leave_destroys_state() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        let last = generation(&h).await;

        h.orchestrator.leave(GUILD).await.unwrap();

        assert_eq!(h.orchestrator.active_guilds(), 0);
        assert_eq!(h.backend.calls().last(), Some(&BackendCall::Disconnect));
        assert!(h.orchestrator.on_track_ended(ended(last)).await.is_err());
        assert_eq!(h.orchestrator.leave(GUILD).await, Err(PlaybackError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnects_after_queue_drains() {
        let mut h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.on_track_ended(ended(generation(&h).await)).await.unwrap();

        let event = h.events.recv().await.unwrap();
        let OrchestratorEvent::IdleExpired { timer_id, .. } = event else {
            panic!("evento inesperado: {:?}", event);
        };
        let disconnected = h.orchestrator.on_idle_expired(GUILD, timer_id).await.unwrap();

        assert!(disconnected);
        assert_eq!(h.orchestrator.active_guilds(), 0);
        assert_eq!(h.backend.calls().last(), Some(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_cancels_armed_idle_timer() {
        let h = harness(OrchestratorSettings::default());
        let events = h.events;
        h.orchestrator.spawn_event_loop(events);
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();
        assert!(h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        h.orchestrator.play(request(&["a"])).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(h.orchestrator.active_guilds(), 1);
        assert!(!h.backend.calls().contains(&BackendCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_claimed_after_cancel_is_stale() {
        let mut h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();
        let OrchestratorEvent::IdleExpired { timer_id, .. } = h.events.recv().await.unwrap() else {
            panic!("se esperaba expiración");
        };

        // El play llega entre la expiración y su procesamiento
        h.orchestrator.play(request(&["a"])).await.unwrap();
        let result = h.orchestrator.on_idle_expired(GUILD, timer_id).await;

        assert!(matches!(result, Err(PlaybackError::StaleEvent { .. })));
        assert_eq!(h.orchestrator.active_guilds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_channel_disconnects_even_while_playing() {
        let mut h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.chat.set_listeners([]);

        h.orchestrator.on_voice_presence_changed(GUILD).await.unwrap();
        assert!(h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);

        let OrchestratorEvent::IdleExpired { timer_id, .. } = h.events.recv().await.unwrap() else {
            panic!("se esperaba expiración");
        };
        assert_eq!(h.orchestrator.on_idle_expired(GUILD, timer_id).await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_returning_cancel_the_timer() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.chat.set_listeners([]);
        h.orchestrator.on_voice_presence_changed(GUILD).await.unwrap();

        h.chat.set_listeners([UserId::new(5)]);
        h.orchestrator.on_voice_presence_changed(GUILD).await.unwrap();

        assert!(!h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_alone_trigger_keeps_listenerless_session() {
        let mut h = harness(OrchestratorSettings {
            idle_when_alone: false,
            ..OrchestratorSettings::default()
        });
        h.orchestrator.play(request(&["c", "a"])).await.unwrap();
        h.chat.set_listeners([]);
        h.orchestrator.on_voice_presence_changed(GUILD).await.unwrap();
        assert!(!h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);

        h.orchestrator.stop(GUILD).await.unwrap();
        let OrchestratorEvent::IdleExpired { timer_id, .. } = h.events.recv().await.unwrap() else {
            panic!("se esperaba expiración");
        };
        // Sin música: el disparador por cola vacía sigue activo
        assert_eq!(h.orchestrator.on_idle_expired(GUILD, timer_id).await, Ok(true));
    }

    #[tokio::test]
    async fn test_guilds_are_independent() {
        let h = harness(OrchestratorSettings::default());
        let other = GuildId::new(2);
        h.orchestrator.play(request(&["c"])).await.unwrap();
        h.orchestrator
            .play(PlayRequest {
                guild_id: other,
                ..request(&["x"])
            })
            .await
            .unwrap();

        h.orchestrator.stop(GUILD).await.unwrap();

        assert_eq!(h.orchestrator.snapshot(other).await.unwrap().current, Some(item("x")));
        assert_eq!(h.orchestrator.active_guilds(), 2);
    }

    #[tokio::test]
    async fn test_queue_page_and_shuffle() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b", "d"])).await.unwrap();

        let page = h.orchestrator.queue_page(GUILD, 1, 2).await.unwrap();
        assert_eq!(titles(&page.items), vec!["a", "b"]);
        assert_eq!(page.total_pages, 2);
        assert_eq!(h.orchestrator.shuffle(GUILD).await, Ok(3));
    }

    fn spawn_play(h: &Harness, titles: &'static [&'static str]) -> JoinHandle<Result<PlayOutcome, PlaybackError>> {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.play(request(titles)).await })
    }

    #[tokio::test]
    async fn test_skip_queued_behind_natural_advance_is_rejected() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();
        let finished = generation(&h).await;

        let slot = h.orchestrator.slot(GUILD).unwrap();
        let held = Arc::clone(&slot.state).lock_owned().await;

        let advance = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.on_track_ended(ended(finished)).await })
        };
        tokio::task::yield_now().await;
        let skip = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.skip(GUILD, 1).await })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(advance.await.unwrap(), Ok(Advance::Started(item("a"))));
        assert_eq!(skip.await.unwrap(), Err(PlaybackError::AlreadyInProgress));
        assert_eq!(h.backend.plays(), vec!["c", "a"]);
        assert_eq!(h.orchestrator.snapshot(GUILD).await.unwrap().current, Some(item("a")));
    }

    #[tokio::test]
    async fn test_stop_while_connecting_keeps_music_from_starting() {
        let h = harness(OrchestratorSettings::default());
        let (entered, release) = h.backend.hold_next_connect();
        let play = spawn_play(&h, &["c", "a"]);
        entered.notified().await;

        let report = h.orchestrator.stop(GUILD).await.unwrap();
        assert_eq!(report, StopReport { cleared: 2, was_playing: false });

        release.notify_one();
        let outcome = play.await.unwrap().unwrap();
        assert_eq!(outcome.started, None);
        assert_eq!(h.backend.plays(), Vec::<String>::new());

        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.queue_len, 0);
        assert!(snapshot.idle_armed);
    }

    #[tokio::test]
    async fn test_concurrent_first_plays_share_one_connection() {
        let h = harness(OrchestratorSettings::default());
        let (entered, release) = h.backend.hold_next_connect();
        let first = spawn_play(&h, &["c"]);
        entered.notified().await;

        let second = h.orchestrator.play(request(&["a"])).await.unwrap();
        assert_eq!(second.started, None);
        assert_eq!(second.position, 2);

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.started, Some(item("c")));
        assert_eq!(
            h.backend.calls(),
            vec![
                BackendCall::Connect(VOICE),
                BackendCall::Play {
                    title: "c".into(),
                    volume: 50,
                    generation: 1
                },
            ]
        );
        assert_eq!(h.orchestrator.active_guilds(), 1);
        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(titles(&snapshot.upcoming), vec!["a"]);
    }

    #[tokio::test]
    async fn test_leave_while_connecting_closes_the_new_session() {
        let h = harness(OrchestratorSettings::default());
        let (entered, release) = h.backend.hold_next_connect();
        let play = spawn_play(&h, &["c"]);
        entered.notified().await;

        assert_eq!(h.orchestrator.leave(GUILD).await, Ok(()));
        assert_eq!(h.orchestrator.active_guilds(), 0);

        release.notify_one();
        assert_eq!(play.await.unwrap(), Err(PlaybackError::NotConnected));
        assert_eq!(h.backend.calls(), vec![BackendCall::Connect(VOICE), BackendCall::Disconnect]);
        assert!(h.orchestrator.snapshot(GUILD).await.is_none());
    }

    #[tokio::test]
    async fn test_waiters_on_a_retired_guild_resolve_again() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c"])).await.unwrap();
        let held = Arc::clone(&h.orchestrator.slot(GUILD).unwrap().state).lock_owned().await;

        let leave = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.leave(GUILD).await })
        };
        tokio::task::yield_now().await;
        let snapshot = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.snapshot(GUILD).await })
        };
        tokio::task::yield_now().await;
        let replay = spawn_play(&h, &["a"]);
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(leave.await.unwrap(), Ok(()));
        assert_eq!(snapshot.await.unwrap(), None);
        assert_eq!(replay.await.unwrap().unwrap().started, Some(item("a")));
        assert_eq!(
            h.backend.calls(),
            vec![
                BackendCall::Connect(VOICE),
                BackendCall::Play {
                    title: "c".into(),
                    volume: 50,
                    generation: 1
                },
                BackendCall::Disconnect,
                BackendCall::Connect(VOICE),
                BackendCall::Play {
                    title: "a".into(),
                    volume: 50,
                    generation: 1
                },
            ]
        );
        assert_eq!(h.orchestrator.active_guilds(), 1);
    }

    #[tokio::test]
    async fn test_join_connects_without_playing() {
        let h = harness(OrchestratorSettings::default());

        assert_eq!(h.orchestrator.join(GUILD, VOICE, TEXT, Some(70)).await, Ok(true));
        assert_eq!(h.orchestrator.join(GUILD, VOICE, TEXT, None).await, Ok(false));
        assert_eq!(h.backend.calls(), vec![BackendCall::Connect(VOICE)]);

        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.volume_pct, 70);
        assert!(snapshot.idle_armed);

        let outcome = h.orchestrator.play(request(&["c"])).await.unwrap();
        assert_eq!(outcome.started, Some(item("c")));
        assert_eq!(h.backend.plays(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_play_during_join_starts_once_connected() {
        let h = harness(OrchestratorSettings::default());
        let (entered, release) = h.backend.hold_next_connect();
        let join = {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.join(GUILD, VOICE, TEXT, None).await })
        };
        entered.notified().await;

        let outcome = h.orchestrator.play(request(&["c"])).await.unwrap();
        assert_eq!(outcome.started, None);

        release.notify_one();
        assert_eq!(join.await.unwrap(), Ok(true));
        assert_eq!(h.backend.plays(), vec!["c"]);
        assert!(!h.orchestrator.snapshot(GUILD).await.unwrap().idle_armed);
    }

    #[tokio::test]
    async fn test_remove_queued_item_by_position() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        assert_eq!(h.orchestrator.remove(GUILD, 2).await, Ok(item("b")));
        assert_eq!(h.orchestrator.remove(GUILD, 5).await, Err(PlaybackError::InvalidPosition(5)));

        let snapshot = h.orchestrator.snapshot(GUILD).await.unwrap();
        assert_eq!(titles(&snapshot.upcoming), vec!["a"]);
        assert_eq!(snapshot.current, Some(item("c")));
    }

    #[tokio::test]
    async fn test_history_lists_finished_items_newest_first() {
        let h = harness(OrchestratorSettings::default());
        h.orchestrator.play(request(&["c", "a", "b"])).await.unwrap();

        h.orchestrator.on_track_ended(ended(generation(&h).await)).await.unwrap();
        h.orchestrator.skip(GUILD, 1).await.unwrap();
        h.orchestrator.stop(GUILD).await.unwrap();

        let history = h.orchestrator.history(GUILD, 10).await.unwrap();
        assert_eq!(titles(&history), vec!["b", "a", "c"]);
    }
}
