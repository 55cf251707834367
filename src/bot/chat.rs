use async_trait::async_trait;
use serenity::{
    builder::EditMessage,
    cache::Cache,
    http::{Http, HttpError},
    model::id::{ChannelId, GuildId, UserId},
};
use std::{collections::HashSet, sync::Arc};

use crate::{
    audio::chat::{ChatPlatform, MessageRef},
    error::ChatError,
};

/// [`ChatPlatform`] sobre la API HTTP y la caché de serenity
pub struct SerenityChat {
    http: Arc<Http>,
    cache: Arc<Cache>,
}

impl SerenityChat {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>) -> Self {
        Self { http, cache }
    }
}

#[async_trait]
impl ChatPlatform for SerenityChat {
    async fn send_message(&self, channel_id: ChannelId, content: String) -> Result<MessageRef, ChatError> {
        let message = channel_id.say(self.http.as_ref(), content).await.map_err(chat_error)?;
        Ok(MessageRef {
            channel_id,
            message_id: message.id,
        })
    }

    async fn edit_message(&self, message: MessageRef, content: String) -> Result<(), ChatError> {
        message
            .channel_id
            .edit_message(self.http.as_ref(), message.message_id, EditMessage::new().content(content))
            .await
            .map(|_| ())
            .map_err(chat_error)
    }

    async fn voice_presence(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<HashSet<UserId>, ChatError> {
        let bot_id = self.cache.current_user().id;
        let guild = self
            .cache
            .guild(guild_id)
            .ok_or_else(|| ChatError::Failed(format!("guild {} no está en caché", guild_id)))?;

        Ok(guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel_id) && state.user_id != bot_id)
            .filter(|state| !state.member.as_ref().is_some_and(|member| member.user.bot))
            .map(|state| state.user_id)
            .collect())
    }
}

/// HTTP 429 es la señal de rate limit; todo lo demás es un fallo definitivo
fn chat_error(error: serenity::Error) -> ChatError {
    match &error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) if response.status_code.as_u16() == 429 => {
            ChatError::RateLimited { retry_after: None }
        }
        _ => ChatError::Failed(error.to_string()),
    }
}
