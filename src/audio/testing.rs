//! Fakes compartidos por los tests del orquestador.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

use super::{
    backend::{AudioBackend, SessionHandle},
    chat::{ChatPlatform, MessageRef},
    queue::{PlayableItem, TrackSource},
};
use crate::error::{BackendError, ChatError};

pub fn item(title: &str) -> PlayableItem {
    PlayableItem::new(title, format!("https://example.com/{title}.mp3"), 1_000, TrackSource::Direct)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Connect(ChannelId),
    Play { title: String, volume: u8, generation: u64 },
    Stop,
    Pause(bool),
    SetVolume(u8),
    Disconnect,
}

/// Backend en memoria. No emite eventos de fin: los tests los inyectan.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail_connect: AtomicBool,
    fail_play: AtomicBool,
    stop_hold: Mutex<Option<Hold>>,
    connect_hold: Mutex<Option<Hold>>,
}

/// `(entered, release)`
pub type Hold = (Arc<Notify>, Arc<Notify>);

fn hold(slot: &Mutex<Option<Hold>>) -> Hold {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    *slot.lock() = Some((Arc::clone(&entered), Arc::clone(&release)));
    (entered, release)
}

async fn wait_if_held(slot: &Mutex<Option<Hold>>) {
    let held = slot.lock().take();
    if let Some((entered, release)) = held {
        entered.notify_one();
        release.notified().await;
    }
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn plays(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Play { title, .. } => Some(title),
                _ => None,
            })
            .collect()
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_plays(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    /// The next `stop` signals `entered` and then blocks until `release`.
    pub fn hold_next_stop(&self) -> Hold {
        hold(&self.stop_hold)
    }

    /// Same as [`hold_next_stop`](Self::hold_next_stop) for `connect`.
    pub fn hold_next_connect(&self) -> Hold {
        hold(&self.connect_hold)
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<SessionHandle, BackendError> {
        wait_if_held(&self.connect_hold).await;
        self.record(BackendCall::Connect(channel_id));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BackendError::Failed("voice gateway timeout".into()));
        }
        Ok(SessionHandle { guild_id, channel_id })
    }

    async fn play(
        &self,
        _session: &SessionHandle,
        item: &PlayableItem,
        volume_pct: u8,
        generation: u64,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Play {
            title: item.title.clone(),
            volume: volume_pct,
            generation,
        });
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(BackendError::Failed("input unavailable".into()));
        }
        Ok(())
    }

    async fn stop(&self, _session: &SessionHandle) -> Result<(), BackendError> {
        wait_if_held(&self.stop_hold).await;
        self.record(BackendCall::Stop);
        Ok(())
    }

    async fn pause(&self, _session: &SessionHandle, paused: bool) -> Result<(), BackendError> {
        self.record(BackendCall::Pause(paused));
        Ok(())
    }

    async fn set_volume(&self, _session: &SessionHandle, volume_pct: u8) -> Result<(), BackendError> {
        self.record(BackendCall::SetVolume(volume_pct));
        Ok(())
    }

    async fn disconnect(&self, _session: &SessionHandle) -> Result<(), BackendError> {
        self.record(BackendCall::Disconnect);
        Ok(())
    }
}

/// Chat en memoria con presencia configurable.
#[derive(Default)]
pub struct FakeChat {
    listeners: Mutex<HashSet<UserId>>,
    sent: Mutex<Vec<(ChannelId, String)>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    next_message: AtomicU64,
}

impl FakeChat {
    pub fn with_listeners(listeners: impl IntoIterator<Item = UserId>) -> Self {
        let chat = Self::default();
        chat.set_listeners(listeners);
        chat
    }

    pub fn set_listeners(&self, listeners: impl IntoIterator<Item = UserId>) {
        *self.listeners.lock() = listeners.into_iter().collect();
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().clone()
    }
}

#[async_trait]
impl ChatPlatform for FakeChat {
    async fn send_message(&self, channel_id: ChannelId, content: String) -> Result<MessageRef, ChatError> {
        self.sent.lock().push((channel_id, content));
        let id = self.next_message.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageRef {
            channel_id,
            message_id: MessageId::new(id),
        })
    }

    async fn edit_message(&self, message: MessageRef, content: String) -> Result<(), ChatError> {
        self.edits.lock().push((message, content));
        Ok(())
    }

    async fn voice_presence(&self, _guild_id: GuildId, _channel_id: ChannelId) -> Result<HashSet<UserId>, ChatError> {
        Ok(self.listeners.lock().clone())
    }
}
