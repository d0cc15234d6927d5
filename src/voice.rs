use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serenity::all::{ChannelId, GuildId, UserId};
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use std::io::Cursor;
use std::sync::Arc;
use symphonia::core::io::ReadOnlySource;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::transcode::PcmBuffer;

/// Transporte de voz: conexión al canal y escritura de PCM.
///
/// La sesión no conoce songbird; habla con este seam, lo que permite
/// probar el motor de reproducción con un transporte falso.
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Self::Handle>;

    /// Reproduce el buffer completo. Resuelve cuando el audio terminó
    /// o cuando el token de cancelación se disparó.
    async fn write(
        &self,
        handle: &Self::Handle,
        pcm: PcmBuffer,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn disconnect(&self, handle: Self::Handle) -> Result<()>;
}

/// Consulta de ocupación de canales de voz (miembros humanos, sin bots)
#[async_trait]
pub trait ChannelRoster: Send + Sync + 'static {
    async fn human_members(&self, guild_id: GuildId, channel_id: ChannelId)
        -> Result<Vec<UserId>>;
}

/// Conexión de voz activa respaldada por songbird
#[derive(Clone)]
pub struct SongbirdConn {
    guild_id: GuildId,
    call: Arc<Mutex<Call>>,
}

/// Transporte de producción sobre songbird
pub struct SongbirdTransport {
    manager: Arc<songbird::Songbird>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<songbird::Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    type Handle = SongbirdConn;

    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Self::Handle> {
        info!("🔊 Conectando al canal de voz {channel_id} en guild {guild_id}");
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| anyhow!("fallo al unirse al canal de voz: {e}"))?;
        Ok(SongbirdConn { guild_id, call })
    }

    async fn write(
        &self,
        handle: &Self::Handle,
        pcm: PcmBuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        let input = raw_pcm_input(pcm);
        let track = {
            let mut call = handle.call.lock().await;
            call.play_input(input)
        };

        let (tx, rx) = oneshot::channel();
        let notify = Arc::new(parking_lot::Mutex::new(Some(tx)));
        track
            .add_event(Event::Track(TrackEvent::End), EndNotify(notify.clone()))
            .map_err(|e| anyhow!("no se pudo registrar evento de fin: {e}"))?;
        track
            .add_event(Event::Track(TrackEvent::Error), EndNotify(notify))
            .map_err(|e| anyhow!("no se pudo registrar evento de error: {e}"))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("⏹️ Track cancelado en guild {}", handle.guild_id);
                let _ = track.stop();
            }
            _ = rx => {}
        }
        Ok(())
    }

    async fn disconnect(&self, handle: Self::Handle) -> Result<()> {
        info!("👋 Desconectando de voz en guild {}", handle.guild_id);
        self.manager
            .remove(handle.guild_id)
            .await
            .map_err(|e| anyhow!("fallo al desconectar: {e}"))?;
        Ok(())
    }
}

/// Envuelve el PCM crudo como input de songbird sin re-decodificar
fn raw_pcm_input(pcm: PcmBuffer) -> songbird::input::Input {
    let source = ReadOnlySource::new(Cursor::new(pcm.into_vec()));
    songbird::input::RawAdapter::new(source, PcmBuffer::SAMPLE_RATE, PcmBuffer::CHANNELS).into()
}

/// Avisa una sola vez cuando el track termina o falla
struct EndNotify(Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>>);

#[async_trait]
impl VoiceEventHandler for EndNotify {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(());
        }
        None
    }
}

/// Ocupación de canales a través del cache de serenity
pub struct SerenityRoster {
    cache: Arc<serenity::cache::Cache>,
}

impl SerenityRoster {
    pub fn new(cache: Arc<serenity::cache::Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ChannelRoster for SerenityRoster {
    async fn human_members(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Vec<UserId>> {
        let guild = self
            .cache
            .guild(guild_id)
            .ok_or_else(|| anyhow!("guild {guild_id} fuera del cache"))?;

        let members = guild
            .voice_states
            .iter()
            .filter(|(_, state)| state.channel_id == Some(channel_id))
            .filter(|(user_id, _)| {
                guild
                    .members
                    .get(user_id)
                    .map_or(true, |member| !member.user.bot)
            })
            .map(|(user_id, _)| *user_id)
            .collect();
        Ok(members)
    }
}
