use anyhow::Result;
use dashmap::DashMap;
use serenity::all::GuildId;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::audio::session::{self, LoopMode, SessionConfig, SessionHandle};
use crate::audio::transcode::TranscodePipe;
use crate::sources::MediaResolver;
use crate::storage::{GuildSettings, SettingsStore};
use crate::voice::{ChannelRoster, VoiceTransport};
use crate::vote::VoteBoard;

/// Estado agregado de una guild: una sesión de reproducción, un registro
/// de votaciones y los ajustes persistidos.
///
/// Se crea en la primera interacción y vive lo que dure el proceso.
pub struct GuildContext {
    pub guild_id: GuildId,
    pub session: SessionHandle,
    pub votes: VoteBoard,
    settings: parking_lot::Mutex<GuildSettings>,
    store: Arc<SettingsStore>,
}

impl GuildContext {
    pub fn settings(&self) -> GuildSettings {
        self.settings.lock().clone()
    }

    /// Cambia el autoplay de la sesión y persiste el ajuste
    pub async fn set_autoplay(&self, enabled: bool) -> Result<()> {
        let snapshot = {
            let mut settings = self.settings.lock();
            settings.auto_play = enabled;
            settings.clone()
        };
        self.session.set_autoplay(enabled).await?;
        self.store.save(&snapshot).await
    }

    /// Cambia el modo de repetición y persiste el ajuste
    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        let snapshot = {
            let mut settings = self.settings.lock();
            settings.set_loop_mode(mode);
            settings.clone()
        };
        self.session.set_loop(mode).await?;
        self.store.save(&snapshot).await
    }
}

/// Registro explícito de contextos por guild.
///
/// Creación perezosa en el primer uso, sin desalojo: la cantidad de
/// guilds está acotada por la membresía del bot. Se pasa por asa, no
/// hay estado global escondido.
pub struct GuildRegistry<V: VoiceTransport> {
    guilds: DashMap<GuildId, Arc<GuildContext>>,
    resolver: Arc<dyn MediaResolver>,
    transcoder: Arc<dyn TranscodePipe>,
    transport: Arc<V>,
    roster: Arc<dyn ChannelRoster>,
    store: Arc<SettingsStore>,
    session_config: SessionConfig,
    vote_timeout: Duration,
}

impl<V: VoiceTransport> GuildRegistry<V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<dyn MediaResolver>,
        transcoder: Arc<dyn TranscodePipe>,
        transport: Arc<V>,
        roster: Arc<dyn ChannelRoster>,
        store: Arc<SettingsStore>,
        session_config: SessionConfig,
        vote_timeout: Duration,
    ) -> Self {
        Self {
            guilds: DashMap::new(),
            resolver,
            transcoder,
            transport,
            roster,
            store,
            session_config,
            vote_timeout,
        }
    }

    pub fn roster(&self) -> &Arc<dyn ChannelRoster> {
        &self.roster
    }

    /// Contexto de una guild, creándolo si es la primera interacción
    pub async fn context(&self, guild_id: GuildId) -> Arc<GuildContext> {
        if let Some(context) = self.guilds.get(&guild_id) {
            return context.clone();
        }

        // la lectura del archivo va fuera del candado del mapa
        let settings = self.store.load(guild_id.get()).await;
        let entry = self.guilds.entry(guild_id).or_insert_with(|| {
            info!("🆕 Contexto creado para guild {guild_id}");
            let session = session::spawn(
                guild_id,
                self.resolver.clone(),
                self.transcoder.clone(),
                self.transport.clone(),
                self.roster.clone(),
                self.session_config.clone(),
                settings.loop_mode(),
                settings.auto_play,
            );
            Arc::new(GuildContext {
                guild_id,
                session,
                votes: VoteBoard::new(self.vote_timeout),
                settings: parking_lot::Mutex::new(settings.clone()),
                store: self.store.clone(),
            })
        });
        entry.clone()
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }
}
