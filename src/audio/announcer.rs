use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tracing::warn;

use super::{
    chat::{ChatPlatform, MessageRef},
    queue::PlayableItem,
    retry::RetryGate,
};

/// Publica los cambios de estado en el canal de texto del guild.
///
/// Corre siempre fuera del lock del guild. Los fallos se registran y no
/// afectan al estado de reproducción.
pub struct Announcer {
    chat: Arc<dyn ChatPlatform>,
    gate: RetryGate,
    now_playing: DashMap<GuildId, (MessageRef, String)>,
}

impl Announcer {
    pub fn new(chat: Arc<dyn ChatPlatform>, gate: RetryGate) -> Self {
        Self {
            chat,
            gate,
            now_playing: DashMap::new(),
        }
    }

    /// Anuncia el nuevo track y marca como terminado el anuncio anterior
    pub async fn now_playing(&self, guild_id: GuildId, channel_id: ChannelId, item: &PlayableItem, volume_pct: u8) {
        self.retire_previous(guild_id).await;

        let content = now_playing_line(item, volume_pct);
        match self
            .gate
            .run("send_message", || self.chat.send_message(channel_id, content.clone()))
            .await
        {
            Ok(message) => {
                self.now_playing.insert(guild_id, (message, item.title.clone()));
            }
            Err(e) => warn!("No se pudo anunciar el track en guild {}: {}", guild_id, e),
        }
    }

    /// Mensaje simple sin seguimiento
    pub async fn notice(&self, channel_id: ChannelId, content: String) {
        if let Err(e) = self
            .gate
            .run("send_message", || self.chat.send_message(channel_id, content.clone()))
            .await
        {
            warn!("No se pudo enviar aviso al canal {}: {}", channel_id, e);
        }
    }

    /// Cierra el anuncio en curso (stop, cola vacía o desconexión)
    pub async fn retire_previous(&self, guild_id: GuildId) {
        let Some((_, (message, title))) = self.now_playing.remove(&guild_id) else {
            return;
        };

        let content = format!("✅ Reproducido: **{}**", title);
        if let Err(e) = self
            .gate
            .run("edit_message", || self.chat.edit_message(message, content.clone()))
            .await
        {
            warn!("No se pudo editar el anuncio anterior en guild {}: {}", guild_id, e);
        }
    }
}

pub fn now_playing_line(item: &PlayableItem, volume_pct: u8) -> String {
    let mut line = format!("🎵 Reproduciendo: **{}**", item.title);
    if let Some(author) = &item.author {
        line.push_str(&format!(" de {}", author));
    }
    line.push_str(&format!(
        " [{}] • {} • 🔊 {}%",
        format_duration(item.duration_ms),
        item.source,
        volume_pct
    ));
    line
}

pub fn format_duration(duration_ms: u64) -> String {
    if duration_ms == 0 {
        return "en vivo".to_string();
    }
    humantime::format_duration(Duration::from_secs(duration_ms / 1000)).to_string()
}
