use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::info;

use super::{
    backend::SessionHandle,
    idle::IdleTimer,
    queue::{PlayableItem, TrackQueue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    Finite(u64),
    Infinite,
}

/// Repetition policy for the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPolicy {
    #[default]
    Off,
    Track(LoopCount),
}

impl LoopPolicy {
    /// `Track(Finite(0))` no repite nada, así que se normaliza a `Off`
    pub fn normalized(self) -> Self {
        match self {
            LoopPolicy::Track(LoopCount::Finite(0)) => LoopPolicy::Off,
            other => other,
        }
    }
}

impl fmt::Display for LoopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopPolicy::Off => f.write_str("desactivado"),
            LoopPolicy::Track(LoopCount::Infinite) => f.write_str("infinito"),
            LoopPolicy::Track(LoopCount::Finite(n)) => write!(f, "{} repeticiones restantes", n),
        }
    }
}

/// Fase de la máquina de estados de un guild.
///
/// `Idle` con `session` presente significa "conectado pero en silencio".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Connecting,
    Playing,
    Paused,
}

/// Result of the pure part of the advance algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceStep {
    /// Loop activo: volver a reproducir el item actual
    Replay(PlayableItem),
    /// Nuevo item sacado de la cola
    Next(PlayableItem),
    /// Cola vacía, nada que reproducir
    Drained,
}

/// Canciones recordadas por `/history`
pub const HISTORY_LIMIT: usize = 50;

/// Per-guild playback record. Only touched while the guild lock is held.
#[derive(Debug)]
pub struct GuildPlaybackState {
    pub guild_id: GuildId,
    pub session: Option<SessionHandle>,
    pub phase: PlaybackPhase,
    pub current: Option<PlayableItem>,
    pub queue: TrackQueue,
    pub volume_pct: u8,
    pub loop_policy: LoopPolicy,
    /// Solo se incrementa con el lock tomado; el registro guarda una copia
    /// del `Arc` para leerlo sin esperar el lock.
    generation: Arc<AtomicU64>,
    /// Items que ya dejaron de sonar, el más reciente al final
    pub history: VecDeque<PlayableItem>,
    pub idle_timer: Option<IdleTimer>,
    /// Canal de texto donde se anuncian los cambios
    pub text_channel: Option<ChannelId>,
    /// La entrada ya fue removida del registro; quien espere el lock debe
    /// volver a buscar el guild.
    pub retired: bool,
}

impl GuildPlaybackState {
    pub fn new(guild_id: GuildId, volume_pct: u8, max_queue_size: usize) -> Self {
        Self {
            guild_id,
            session: None,
            phase: PlaybackPhase::Idle,
            current: None,
            queue: TrackQueue::new(max_queue_size),
            volume_pct: volume_pct.min(100),
            loop_policy: LoopPolicy::Off,
            generation: Arc::new(AtomicU64::new(0)),
            history: VecDeque::new(),
            idle_timer: None,
            text_channel: None,
            retired: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn generation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    /// Invalida cualquier callback pendiente y devuelve la nueva generación
    pub fn bump_generation(&mut self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Saca `current` y lo guarda en el historial
    pub fn retire_current(&mut self) -> Option<PlayableItem> {
        let finished = self.current.take()?;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(finished.clone());
        Some(finished)
    }

    /// Últimos `limit` items del historial, el más reciente primero
    pub fn recent_history(&self, limit: usize) -> Vec<PlayableItem> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    /// Nothing current and nothing queued.
    pub fn is_drained(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn is_idle_armed(&self) -> bool {
        self.idle_timer.is_some()
    }

    pub fn armed_timer_id(&self) -> Option<u64> {
        self.idle_timer.as_ref().map(IdleTimer::id)
    }

    /// Runs the loop/queue part of the advance algorithm.
    ///
    /// 1. A track loop with repetitions left replays `current` (decrementing
    ///    finite counts) without touching the queue.
    /// 2. An exhausted track loop is cleared and falls through.
    /// 3. Otherwise the queue front becomes `current`; an empty queue leaves
    ///    `current = None`.
    pub fn select_next(&mut self) -> AdvanceStep {
        if let (LoopPolicy::Track(count), Some(current)) = (self.loop_policy, self.current.as_ref()) {
            match count {
                LoopCount::Infinite => return AdvanceStep::Replay(current.clone()),
                LoopCount::Finite(remaining) if remaining > 0 => {
                    self.loop_policy = LoopPolicy::Track(LoopCount::Finite(remaining - 1));
                    return AdvanceStep::Replay(current.clone());
                }
                LoopCount::Finite(_) => {
                    info!("🔁 Loop terminado en guild {}", self.guild_id);
                    self.loop_policy = LoopPolicy::Off;
                }
            }
        }

        // Un loop sin item actual no tiene sentido
        if self.current.is_none() {
            self.loop_policy = LoopPolicy::Off;
        }

        self.retire_current();
        match self.queue.pop_front() {
            Some(next) => {
                self.current = Some(next.clone());
                AdvanceStep::Next(next)
            }
            None => AdvanceStep::Drained,
        }
    }
}
