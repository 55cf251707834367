//! Resolución de consultas de usuario a items reproducibles.

pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use crate::audio::queue::{PlayableItem, TrackSource};

pub use ytdlp::YtDlpResolver;

/// Convierte lo que escribió el usuario (URL o texto libre) en items
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Vec<PlayableItem>>;

    /// Hasta `limit` candidatos para mostrar, sin encolar nada
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PlayableItem>>;
}

const AUDIO_EXTENSIONS: [&str; 6] = [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus"];

pub fn is_url(query: &str) -> bool {
    Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// URLs de playlist de YouTube o sets de SoundCloud
pub fn is_playlist(query: &str) -> bool {
    is_url(query) && (query.contains("list=") || query.contains("/playlist") || query.contains("/sets/"))
}

/// Archivo de audio servido directamente por HTTP
pub fn is_direct_audio(query: &str) -> bool {
    let Ok(url) = Url::parse(query) else {
        return false;
    };
    let path = url.path().to_lowercase();
    AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

pub fn detect_source(uri: &str) -> TrackSource {
    if is_direct_audio(uri) {
        return TrackSource::Direct;
    }

    let host = Url::parse(uri)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()));

    match host.as_deref() {
        Some("youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtu.be") => TrackSource::YouTube,
        Some("soundcloud.com" | "on.soundcloud.com") => TrackSource::SoundCloud,
        Some(h) if h.ends_with("bandcamp.com") => TrackSource::Bandcamp,
        Some("twitch.tv" | "m.twitch.tv") => TrackSource::Twitch,
        Some("vimeo.com" | "player.vimeo.com") => TrackSource::Vimeo,
        _ => TrackSource::Other,
    }
}

/// Item para una URL de audio directa, sin pasar por yt-dlp
pub fn direct_item(uri: &str) -> Option<PlayableItem> {
    if !is_direct_audio(uri) {
        return None;
    }

    let title = Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uri.to_string());

    Some(PlayableItem::new(title, uri, 0, TrackSource::Direct))
}
