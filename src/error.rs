use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the playback orchestrator.
///
/// `NotConnected` and `NothingPlaying` are ordinary outcomes that the bot
/// shows to the requester as a normal reply. `StaleEvent` is never shown
/// to users; the event loop logs it and moves on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no hay una sesión de voz activa en este servidor")]
    NotConnected,

    #[error("no hay ninguna canción reproduciéndose")]
    NothingPlaying,

    #[error("ya hay un cambio de canción en curso, inténtalo de nuevo")]
    AlreadyInProgress,

    #[error("no hay ninguna canción en la posición {0} de la cola")]
    InvalidPosition(usize),

    #[error("el backend de audio no está disponible: {0}")]
    BackendUnavailable(String),

    #[error("evento obsoleto para guild {guild_id} (generación {received}, actual {current:?})")]
    StaleEvent {
        guild_id: GuildId,
        received: u64,
        current: Option<u64>,
    },
}

/// Failures reported by an [`AudioBackend`](crate::audio::backend::AudioBackend).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("rate limit del backend de audio")]
    RateLimited { retry_after: Option<Duration> },

    #[error("no existe sesión de voz para guild {0}")]
    NoSession(GuildId),

    #[error("{0}")]
    Failed(String),
}

/// Failures reported by a [`ChatPlatform`](crate::audio::chat::ChatPlatform).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("rate limit de la plataforma de chat")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{0}")]
    Failed(String),
}

/// Classifies an outbound failure for the [`RetryGate`](crate::audio::retry::RetryGate).
pub trait Retryable {
    /// Whether the failure is a rate-limit signal worth retrying.
    fn is_rate_limited(&self) -> bool;

    /// Delay requested by the remote side, if it sent one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for BackendError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl Retryable for ChatError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, ChatError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ChatError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
