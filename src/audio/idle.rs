use serenity::model::id::GuildId;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use super::events::{EventSender, OrchestratorEvent};

/// Armed disconnect timer. Dropping it cancels the pending expiry.
#[derive(Debug)]
pub struct IdleTimer {
    id: u64,
    _guard: DropGuard,
}

impl IdleTimer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Spawns per-guild inactivity timers.
///
/// Expiry is reported as [`OrchestratorEvent::IdleExpired`]; deciding whether
/// to disconnect is left to the orchestrator, which re-checks the guild
/// under its lock.
#[derive(Debug)]
pub struct IdleMonitor {
    events: EventSender,
    next_id: AtomicU64,
}

impl IdleMonitor {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arm(&self, guild_id: GuildId, duration: Duration) -> IdleTimer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("⏹️ Timer de inactividad {} cancelado en guild {}", id, guild_id);
                }
                _ = tokio::time::sleep(duration) => {
                    debug!("⏰ Timer de inactividad {} expiró en guild {}", id, guild_id);
                    // El receptor puede haberse cerrado durante el apagado
                    let _ = events.send(OrchestratorEvent::IdleExpired { guild_id, timer_id: id });
                }
            }
        });

        debug!("⏱️ Timer de inactividad {} armado en guild {} ({:?})", id, guild_id, duration);
        IdleTimer {
            id,
            _guard: token.drop_guard(),
        }
    }
}
