//! Colaboradores falsos para probar el motor sin Discord ni red.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serenity::all::{ChannelId, GuildId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::transcode::{PcmBuffer, TranscodePipe};
use crate::sources::{AudioStream, MediaItem, MediaResolver};
use crate::voice::{ChannelRoster, VoiceTransport};

pub(crate) fn item(id: &str, secs: u64) -> MediaItem {
    MediaItem {
        id: id.to_string(),
        title: format!("Track {id}"),
        author: "Artista".to_string(),
        duration: Some(Duration::from_secs(secs)),
        url: format!("https://www.youtube.com/watch?v={id}"),
    }
}

#[derive(Default)]
pub(crate) struct FakeResolver {
    direct: HashMap<String, MediaItem>,
    playlists: HashMap<String, Vec<MediaItem>>,
    search_results: Vec<MediaItem>,
    related: Vec<String>,
}

impl FakeResolver {
    pub(crate) fn with_direct(mut self, item: MediaItem) -> Self {
        self.direct.insert(item.id.clone(), item);
        self
    }

    pub(crate) fn with_playlist(mut self, key: &str, items: Vec<MediaItem>) -> Self {
        self.playlists.insert(key.to_string(), items);
        self
    }

    pub(crate) fn with_search(mut self, items: Vec<MediaItem>) -> Self {
        self.search_results = items;
        self
    }

    pub(crate) fn with_related(mut self, ids: &[&str]) -> Self {
        self.related = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
impl MediaResolver for FakeResolver {
    async fn resolve_direct(&self, reference: &str) -> Result<Option<MediaItem>> {
        Ok(self.direct.get(reference).cloned())
    }

    async fn resolve_playlist(&self, reference: &str) -> Result<Vec<MediaItem>> {
        Ok(self.playlists.get(reference).cloned().unwrap_or_default())
    }

    async fn search(&self, _text: &str) -> Result<Vec<MediaItem>> {
        Ok(self.search_results.clone())
    }

    async fn find_related(&self, _item_id: &str) -> Result<Vec<String>> {
        Ok(self.related.clone())
    }

    async fn open_stream(&self, _item: &MediaItem) -> Result<AudioStream> {
        Ok(AudioStream::new(tokio::io::empty()))
    }
}

pub(crate) struct FakeTranscoder;

#[async_trait]
impl TranscodePipe for FakeTranscoder {
    async fn transcode(&self, _stream: AudioStream) -> Result<PcmBuffer> {
        Ok(PcmBuffer(Bytes::from_static(&[0u8; 4])))
    }
}

/// Transporte falso: cada track "suena" hasta que lo cancelen
#[derive(Default)]
pub(crate) struct FakeTransport {
    pub(crate) fail_connect: AtomicBool,
    pub(crate) connects: AtomicUsize,
    pub(crate) disconnects: AtomicUsize,
    pub(crate) writes: AtomicUsize,
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    type Handle = ();

    async fn connect(&self, _guild_id: GuildId, _channel_id: ChannelId) -> Result<Self::Handle> {
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("conexión rechazada");
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(
        &self,
        _handle: &Self::Handle,
        _pcm: PcmBuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Ok(())
    }

    async fn disconnect(&self, _handle: Self::Handle) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeRoster {
    members: parking_lot::Mutex<Vec<UserId>>,
}

impl FakeRoster {
    pub(crate) fn with_members(ids: &[u64]) -> Self {
        Self {
            members: parking_lot::Mutex::new(ids.iter().map(|&id| UserId::new(id)).collect()),
        }
    }

    pub(crate) fn set_members(&self, ids: &[u64]) {
        *self.members.lock() = ids.iter().map(|&id| UserId::new(id)).collect();
    }
}

#[async_trait]
impl ChannelRoster for FakeRoster {
    async fn human_members(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> Result<Vec<UserId>> {
        Ok(self.members.lock().clone())
    }
}
