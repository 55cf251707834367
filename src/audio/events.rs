use serenity::model::id::GuildId;
use tokio::sync::mpsc;

/// Why the backend reported the end of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    /// El track llegó al final
    Finished,
    /// Alguien (nosotros u otro) detuvo el track
    Stopped,
    /// El input falló al decodificar o descargar
    Errored,
}

/// Notificación asíncrona de fin de track emitida por el backend.
///
/// `generation` es el valor que el orquestador pasó a `play`; si ya no
/// coincide con la generación del guild el evento es obsoleto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEnded {
    pub guild_id: GuildId,
    pub generation: u64,
    pub reason: TrackEndReason,
}

/// Messages delivered to the orchestrator's serialization point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    TrackEnded(TrackEnded),
    IdleExpired { guild_id: GuildId, timer_id: u64 },
    PresenceChanged { guild_id: GuildId },
}

pub type EventSender = mpsc::UnboundedSender<OrchestratorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<OrchestratorEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
