use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::collections::HashSet;

use crate::error::ChatError;

/// Referencia a un mensaje enviado, para poder editarlo después
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// What the orchestrator consumes from the chat platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_message(&self, channel_id: ChannelId, content: String) -> Result<MessageRef, ChatError>;

    async fn edit_message(&self, message: MessageRef, content: String) -> Result<(), ChatError>;

    /// Non-bot users currently connected to `channel_id`.
    async fn voice_presence(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<HashSet<UserId>, ChatError>;
}
