use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::{audio::queue::PlayableItem, error::BackendError};

/// An active voice connection on the audio backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

/// Contract the orchestrator needs from the audio relay.
///
/// Implementations report the end of every track started through
/// [`play`](AudioBackend::play) by sending
/// [`OrchestratorEvent::TrackEnded`](super::events::OrchestratorEvent)
/// tagged with the `generation` received here.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<SessionHandle, BackendError>;

    async fn play(
        &self,
        session: &SessionHandle,
        item: &PlayableItem,
        volume_pct: u8,
        generation: u64,
    ) -> Result<(), BackendError>;

    async fn stop(&self, session: &SessionHandle) -> Result<(), BackendError>;

    async fn pause(&self, session: &SessionHandle, paused: bool) -> Result<(), BackendError>;

    async fn set_volume(&self, session: &SessionHandle, volume_pct: u8) -> Result<(), BackendError>;

    async fn disconnect(&self, session: &SessionHandle) -> Result<(), BackendError>;
}
