use rand::seq::SliceRandom;
use std::{collections::VecDeque, fmt, time::Duration};
use tracing::{debug, info};

/// Plataforma de origen de un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    YouTube,
    SoundCloud,
    Bandcamp,
    Twitch,
    Vimeo,
    Direct,
    Other,
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackSource::YouTube => "YouTube",
            TrackSource::SoundCloud => "SoundCloud",
            TrackSource::Bandcamp => "Bandcamp",
            TrackSource::Twitch => "Twitch",
            TrackSource::Vimeo => "Vimeo",
            TrackSource::Direct => "URL directa",
            TrackSource::Other => "Otro",
        };
        f.write_str(name)
    }
}

/// A resolved, immutable audio item.
///
/// Created by a [`TrackResolver`](crate::sources::TrackResolver) and owned by
/// whichever queue slot or "current" slot holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayableItem {
    pub title: String,
    pub uri: String,
    pub duration_ms: u64,
    pub source: TrackSource,
    pub author: Option<String>,
}

impl PlayableItem {
    pub fn new(title: impl Into<String>, uri: impl Into<String>, duration_ms: u64, source: TrackSource) -> Self {
        Self {
            title: title.into(),
            uri: uri.into(),
            duration_ms,
            source,
            author: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Cola FIFO de items pendientes de un guild.
///
/// Nunca contiene el item que está sonando; ese vive en
/// [`GuildPlaybackState::current`](super::state::GuildPlaybackState).
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<PlayableItem>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un item al final
    pub fn push(&mut self, item: PlayableItem) {
        debug!("➕ Agregado a la cola: {}", item.title);
        self.items.push_back(item);
    }

    /// Devuelve un item al frente (usado cuando falla el dispatch)
    pub fn push_front(&mut self, item: PlayableItem) {
        self.items.push_front(item);
    }

    /// Saca el siguiente item (FIFO)
    pub fn pop_front(&mut self) -> Option<PlayableItem> {
        self.items.pop_front()
    }

    /// Copia de los primeros `n` items sin modificar la cola
    pub fn peek_range(&self, n: usize) -> Vec<PlayableItem> {
        self.items.iter().take(n).cloned().collect()
    }

    /// Descarta hasta `n` items del frente y devuelve cuántos se descartaron
    pub fn discard_front(&mut self, n: usize) -> usize {
        let discarded = n.min(self.items.len());
        self.items.drain(..discarded);
        discarded
    }

    /// Quita el item en la posición `position` (1-based)
    pub fn remove(&mut self, position: usize) -> Option<PlayableItem> {
        let removed = self.items.remove(position.checked_sub(1)?)?;
        debug!("➖ Removido de la cola: {}", removed.title);
        Some(removed)
    }

    /// Limpia la cola y devuelve cuántos items había
    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        if cleared > 0 {
            info!("🗑️ Cola limpiada: {} items removidos", cleared);
        }
        cleared
    }

    /// Mezcla los items restantes (permutación uniforme)
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada ({} items)", self.items.len());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.max_size.saturating_sub(self.items.len())
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(PlayableItem::duration).sum()
    }

    /// Obtiene una página de la cola (páginas empiezan en 1)
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_items = self.items.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * items_per_page;

        QueuePage {
            items: self.items.iter().skip(start).take(items_per_page).cloned().collect(),
            first_position: start + 1,
            current_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePage {
    pub items: Vec<PlayableItem>,
    /// 1-based position of the first item of this page in the queue
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
