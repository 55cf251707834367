//! # Audio Module
//!
//! Per-guild playback orchestration for Guild Jukebox.
//!
//! ## Architecture
//!
//! ### [`orchestrator`] - State machine
//! - One [`GuildPlaybackState`](state::GuildPlaybackState) per guild behind its own lock
//! - Serializes commands, backend callbacks, presence changes and idle expiries
//! - Generation counter discards superseded track-end events
//!
//! ### [`queue`] - Queue
//! - FIFO of pending [`PlayableItem`](queue::PlayableItem)s with a size cap
//! - Shuffle and paging for the `/queue` command
//!
//! ### [`idle`] and [`retry`] - Timers
//! - Cancellable inactivity timers reported through [`events`]
//! - Bounded exponential backoff on rate-limit signals
//!
//! ### Collaborators
//! - [`backend::AudioBackend`], implemented over songbird by [`songbird_backend`]
//! - [`chat::ChatPlatform`], used by [`announcer`] for now-playing messages

pub mod announcer;
pub mod backend;
pub mod chat;
pub mod events;
pub mod idle;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod songbird_backend;
pub mod state;

#[cfg(test)]
pub mod testing;
