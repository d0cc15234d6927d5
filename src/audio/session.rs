use anyhow::{anyhow, Result};
use rand::Rng;
use serenity::all::{ChannelId, GuildId, UserId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::idle::IdleMonitor;
use crate::audio::queue::QueueStore;
use crate::audio::transcode::TranscodePipe;
use crate::sources::{MediaItem, MediaResolver};
use crate::voice::{ChannelRoster, VoiceTransport};

/// Pausa entre altas de items de playlist en segundo plano
const PLAYLIST_EXPANSION_PACE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Playing,
    Stopped,
}

impl SessionState {
    /// Idle y Stopped son equivalentes para toda operación posterior
    pub fn is_resting(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }
}

/// Modo de repetición de la sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Disabled,
    Song,
}

impl LoopMode {
    /// Código entero persistido en los ajustes de guild
    pub fn code(self) -> u8 {
        match self {
            LoopMode::Disabled => 0,
            LoopMode::Song => 1,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => LoopMode::Song,
            _ => LoopMode::Disabled,
        }
    }
}

/// Canal de voz del solicitante, con nombre para los mensajes de rechazo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannelRef {
    pub id: ChannelId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub query: String,
    pub channel: Option<VoiceChannelRef>,
    /// Solo relevante si la consulta resulta ser una playlist
    pub shuffle_playlist: bool,
    /// Insertar al frente de la cola en vez de al final
    pub force_immediate: bool,
    pub requester: UserId,
}

/// Resultado tipado de una petición de reproducción.
/// Cada variante corresponde a exactamente una respuesta al usuario.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Success(MediaItem),
    PlayingAsPlaylist {
        first: MediaItem,
        resolved: Vec<MediaItem>,
    },
    Queued(MediaItem),
    QueuedFirst(MediaItem),
    QueuedAsPlaylist {
        first: MediaItem,
        resolved: Vec<MediaItem>,
    },
    InvalidQuery,
    TooLong(MediaItem),
    OnlyNonPlaylistAllowed,
    NoVoiceChannel,
    DifferentVoiceChannels {
        bound: String,
    },
    VoiceChannelEmpty,
    JoiningChannelFailed,
    StreamFailed,
}

/// Intenciones que procesa el actor de la sesión, una a la vez.
///
/// Toda mutación del estado de reproducción de una guild entra por acá:
/// comandos, temporizadores y tareas de fondo compiten solo por el buzón,
/// nunca por los campos.
pub(crate) enum SessionIntent {
    Play {
        request: PlayRequest,
        reply: oneshot::Sender<PlayOutcome>,
    },
    Skip {
        reply: oneshot::Sender<Option<MediaItem>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetLoop {
        mode: LoopMode,
        reply: oneshot::Sender<()>,
    },
    SetAutoplay {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Shuffle {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Fin del buffer de un pipeline; lleva el token de esa reproducción
    /// para poder descartar avisos de pipelines ya cancelados
    TrackEnded {
        cancel: CancellationToken,
    },
    /// Pulso de la población de playlist en fondo: volcar un pendiente
    ExpansionTick,
    IdleCheck,
}

/// Vista inmutable del estado de la sesión para respuestas y tests
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub current: Option<MediaItem>,
    pub lookahead: Option<MediaItem>,
    pub queue_titles: Vec<String>,
    pub queue_len: usize,
    pub queue_complete: bool,
    pub queue_pages: Vec<String>,
    pub bound_channel: Option<VoiceChannelRef>,
    pub connected: bool,
    pub loop_mode: LoopMode,
    pub autoplay: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Límite duro de duración por track (1 hora)
    pub max_track_duration: Duration,
    /// Cadencia del monitor de inactividad recién unido al canal
    pub idle_fresh_interval: Duration,
    /// Cadencia del monitor durante la reproducción
    pub idle_playing_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_track_duration: Duration::from_secs(3600),
            idle_fresh_interval: Duration::from_secs(60),
            idle_playing_interval: Duration::from_secs(300),
        }
    }
}

/// Asa pública de la sesión: serializa todas las operaciones a través
/// del buzón del actor
#[derive(Clone)]
pub struct SessionHandle {
    mailbox: flume::Sender<SessionIntent>,
}

impl SessionHandle {
    pub async fn play(&self, request: PlayRequest) -> Result<PlayOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Play { request, reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn skip(&self) -> Result<Option<MediaItem>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Skip { reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Stop { reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::SetLoop { mode, reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn set_autoplay(&self, enabled: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::SetAutoplay { enabled, reply })
            .await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn shuffle(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Shuffle { reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Snapshot { reply }).await?;
        rx.await.map_err(|_| anyhow!("la sesión terminó"))
    }

    async fn send(&self, intent: SessionIntent) -> Result<()> {
        self.mailbox
            .send_async(intent)
            .await
            .map_err(|_| anyhow!("la sesión terminó"))
    }

    #[cfg(test)]
    pub(crate) async fn inject(&self, intent: SessionIntent) {
        let _ = self.mailbox.send_async(intent).await;
    }
}

/// Lanza el actor de reproducción de una guild y devuelve su asa
pub fn spawn<V: VoiceTransport>(
    guild_id: GuildId,
    resolver: Arc<dyn MediaResolver>,
    transcoder: Arc<dyn TranscodePipe>,
    transport: Arc<V>,
    roster: Arc<dyn ChannelRoster>,
    config: SessionConfig,
    loop_mode: LoopMode,
    autoplay: bool,
) -> SessionHandle {
    let (tx, rx) = flume::unbounded();
    let session = PlaybackSession {
        guild_id,
        resolver,
        transcoder,
        transport,
        roster,
        config,
        mailbox: tx.clone(),
        state: SessionState::Idle,
        bound: None,
        connection: None,
        current: None,
        lookahead: None,
        queue: QueueStore::new(),
        pending: VecDeque::new(),
        loop_mode,
        autoplay,
        cancel: CancellationToken::new(),
        idle: IdleMonitor::new(),
        pipeline: None,
        expansion: None,
    };
    tokio::spawn(session.run(rx));
    SessionHandle { mailbox: tx }
}

/// Máquina de estados de reproducción por guild.
///
/// Un actor por guild: dueño exclusivo de la cola, la conexión de voz y
/// el pipeline activo. Como máximo un pipeline de transcodificación y
/// escritura por sesión; el token de cancelación se reemplaza (no se
/// reutiliza) en cada arranque, así una cancelación vieja no puede tocar
/// un track nuevo, y cada aviso de fin lleva el token de su reproducción,
/// así un fin rezagado no avanza la cola de más.
struct PlaybackSession<V: VoiceTransport> {
    guild_id: GuildId,
    resolver: Arc<dyn MediaResolver>,
    transcoder: Arc<dyn TranscodePipe>,
    transport: Arc<V>,
    roster: Arc<dyn ChannelRoster>,
    config: SessionConfig,
    mailbox: flume::Sender<SessionIntent>,
    state: SessionState,
    bound: Option<VoiceChannelRef>,
    connection: Option<V::Handle>,
    current: Option<MediaItem>,
    /// Objetivo precalculado de "qué suena después"; mejor esfuerzo,
    /// recalculado en cada mutación de la cola
    lookahead: Option<MediaItem>,
    queue: QueueStore,
    /// Resto de la playlist aún no volcado a la cola; mientras no esté
    /// vacío la cola se reporta como incompleta
    pending: VecDeque<MediaItem>,
    loop_mode: LoopMode,
    autoplay: bool,
    cancel: CancellationToken,
    idle: IdleMonitor,
    pipeline: Option<tokio::task::JoinHandle<()>>,
    expansion: Option<tokio::task::JoinHandle<()>>,
}

enum Resolved {
    Single(MediaItem),
    Playlist { head: MediaItem, tail: Vec<MediaItem> },
}

impl<V: VoiceTransport> PlaybackSession<V> {
    async fn run(mut self, rx: flume::Receiver<SessionIntent>) {
        while let Ok(intent) = rx.recv_async().await {
            self.handle(intent).await;
        }
        // el registro soltó el asa: liberar la conexión
        self.stop().await;
    }

    async fn handle(&mut self, intent: SessionIntent) {
        match intent {
            SessionIntent::Play { request, reply } => {
                let outcome = self.play(request).await;
                let _ = reply.send(outcome);
            }
            SessionIntent::Skip { reply } => {
                let started = self.next_song(true).await;
                let _ = reply.send(started);
            }
            SessionIntent::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            SessionIntent::SetLoop { mode, reply } => {
                self.loop_mode = mode;
                let _ = reply.send(());
            }
            SessionIntent::SetAutoplay { enabled, reply } => {
                self.autoplay = enabled;
                let _ = reply.send(());
            }
            SessionIntent::Shuffle { reply } => {
                self.queue.shuffle();
                self.lookahead = self.queue.front().cloned();
                let _ = reply.send(self.queue.len());
            }
            SessionIntent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionIntent::TrackEnded { cancel } => {
                // solo vale si nadie canceló esa reproducción entretanto
                if cancel.is_cancelled() {
                    debug!("⏭️ Fin de track obsoleto descartado en guild {}", self.guild_id);
                } else {
                    self.next_song(false).await;
                }
            }
            SessionIntent::ExpansionTick => self.expansion_tick(),
            SessionIntent::IdleCheck => self.idle_check().await,
        }
    }

    /// Petición de reproducción (§ comando play).
    ///
    /// Los rechazos no mutan estado, o lo restauran por completo.
    async fn play(&mut self, request: PlayRequest) -> PlayOutcome {
        if request.query.trim().is_empty() {
            return PlayOutcome::InvalidQuery;
        }
        let Some(channel) = request.channel.clone() else {
            return PlayOutcome::NoVoiceChannel;
        };

        // Enlace de canal: una sesión corriendo en un canal no puede ser
        // secuestrada por una petición desde otro
        if let Some(bound) = &self.bound {
            if bound.id != channel.id {
                return PlayOutcome::DifferentVoiceChannels {
                    bound: bound.name.clone(),
                };
            }
        }
        let freshly_bound = self.bound.is_none();
        if freshly_bound {
            self.bound = Some(channel.clone());
        }

        let resolved = match self.resolve(&request).await {
            Ok(resolved) => resolved,
            Err(outcome) => {
                if freshly_bound {
                    self.bound = None;
                }
                return outcome;
            }
        };

        let (head, tail, is_playlist) = match resolved {
            Resolved::Single(item) => (item, Vec::new(), false),
            Resolved::Playlist { head, tail } => (head, tail, true),
        };
        let full_list = if is_playlist {
            let mut list = vec![head.clone()];
            list.extend(tail.iter().cloned());
            list
        } else {
            Vec::new()
        };

        if self.state == SessionState::Playing {
            let outcome = if request.force_immediate {
                self.queue.insert_front(head.clone());
                PlayOutcome::QueuedFirst(head)
            } else if is_playlist {
                self.queue.append(head.clone());
                self.spawn_expansion(tail);
                PlayOutcome::QueuedAsPlaylist {
                    first: head,
                    resolved: full_list,
                }
            } else {
                self.queue.append(head.clone());
                PlayOutcome::Queued(head)
            };
            self.lookahead = self.queue.front().cloned();
            return outcome;
        }

        // Un enlace viejo puede apuntar a un canal ya vacío: re-verificar
        match self.roster.human_members(self.guild_id, channel.id).await {
            Ok(members) if !members.is_empty() => {}
            _ => {
                if freshly_bound {
                    self.bound = None;
                }
                return PlayOutcome::VoiceChannelEmpty;
            }
        }

        if is_playlist {
            self.spawn_expansion(tail);
        }
        match self.start_playback(head.clone()).await {
            Ok(()) => {
                if is_playlist {
                    PlayOutcome::PlayingAsPlaylist {
                        first: head,
                        resolved: full_list,
                    }
                } else {
                    PlayOutcome::Success(head)
                }
            }
            Err(outcome) => {
                if freshly_bound {
                    self.bound = None;
                }
                outcome
            }
        }
    }

    /// Cadena de resolución: referencia directa → playlist → búsqueda
    async fn resolve(&self, request: &PlayRequest) -> Result<Resolved, PlayOutcome> {
        let query = request.query.trim();

        match self.resolver.resolve_direct(query).await {
            Ok(Some(item)) => {
                if item.longer_than(self.config.max_track_duration) {
                    return Err(PlayOutcome::TooLong(item));
                }
                return Ok(Resolved::Single(item));
            }
            Ok(None) => {}
            Err(e) => debug!("resolución directa falló: {e:#}"),
        }

        match self.resolver.resolve_playlist(query).await {
            Ok(items) if !items.is_empty() => {
                // Insertar una playlist completa al frente no tiene
                // semántica definida
                if request.force_immediate {
                    return Err(PlayOutcome::OnlyNonPlaylistAllowed);
                }
                let mut items = items;
                let head_index = if request.shuffle_playlist {
                    rand::thread_rng().gen_range(0..items.len())
                } else {
                    0
                };
                let head = items.remove(head_index);
                if head.longer_than(self.config.max_track_duration) {
                    return Err(PlayOutcome::TooLong(head));
                }
                return Ok(Resolved::Playlist { head, tail: items });
            }
            Ok(_) => {}
            Err(e) => debug!("resolución de playlist falló: {e:#}"),
        }

        match self.resolver.search(query).await {
            Ok(results) => {
                let limit = self.config.max_track_duration;
                match results.into_iter().find(|item| !item.longer_than(limit)) {
                    Some(item) => Ok(Resolved::Single(item)),
                    None => Err(PlayOutcome::InvalidQuery),
                }
            }
            Err(e) => {
                warn!("búsqueda falló para {query:?}: {e:#}");
                Err(PlayOutcome::InvalidQuery)
            }
        }
    }

    /// Arranca el pipeline de un track: stream → PCM → transporte.
    /// En fallo restaura el estado previo al intento.
    async fn start_playback(&mut self, item: MediaItem) -> Result<(), PlayOutcome> {
        let Some(channel) = self.bound.clone() else {
            return Err(PlayOutcome::NoVoiceChannel);
        };

        let pcm = match self.fetch_pcm(&item).await {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("❌ No se pudo preparar el audio de {}: {e:#}", item.title);
                return Err(PlayOutcome::StreamFailed);
            }
        };

        let freshly_connected = self.connection.is_none();
        if freshly_connected {
            self.state = SessionState::Connecting;
            match self.transport.connect(self.guild_id, channel.id).await {
                Ok(conn) => {
                    self.connection = Some(conn);
                }
                Err(e) => {
                    error!("❌ Fallo al conectar al canal {}: {e:#}", channel.name);
                    self.state = SessionState::Idle;
                    self.bound = None;
                    return Err(PlayOutcome::JoiningChannelFailed);
                }
            }
        }
        let Some(conn) = self.connection.clone() else {
            return Err(PlayOutcome::JoiningChannelFailed);
        };

        // Token nuevo por arranque: una cancelación vieja no afecta
        // al track que está por empezar
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        self.current = Some(item.clone());
        self.state = SessionState::Playing;
        self.lookahead = self.queue.front().cloned();

        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let title = item.title.clone();
        self.pipeline = Some(tokio::spawn(async move {
            if let Err(e) = transport.write(&conn, pcm, cancel.clone()).await {
                warn!("❌ El transporte falló reproduciendo {title}: {e:#}");
            }
            let _ = mailbox.send_async(SessionIntent::TrackEnded { cancel }).await;
        }));

        // recién unidos al canal el primer chequeo de ocupación es pronto
        let first = if freshly_connected {
            self.config.idle_fresh_interval
        } else {
            self.config.idle_playing_interval
        };
        self.idle
            .arm(first, self.config.idle_playing_interval, self.mailbox.clone());
        info!("▶️ Reproduciendo: {} en guild {}", item.title, self.guild_id);
        Ok(())
    }

    async fn fetch_pcm(
        &self,
        item: &MediaItem,
    ) -> Result<crate::audio::transcode::PcmBuffer> {
        let stream = self.resolver.open_stream(item).await?;
        self.transcoder.transcode(stream).await
    }

    /// Avanza al siguiente track. Llamado al terminar el buffer actual
    /// o explícitamente vía Skip (force=true).
    ///
    /// Devuelve el track que empezó a sonar, o None si la sesión paró.
    async fn next_song(&mut self, force: bool) -> Option<MediaItem> {
        // cancelar el pipeline activo; re-cancelar es inofensivo
        self.cancel.cancel();
        self.pipeline = None;

        if !force && self.loop_mode == LoopMode::Song {
            if let Some(current) = self.current.clone() {
                info!("🔂 Repitiendo: {}", current.title);
                if self.start_playback(current.clone()).await.is_ok() {
                    return Some(current);
                }
                // si la repetición falla, seguir con la cola
            }
        }

        // la población de playlist puede no haber volcado nada todavía:
        // un pendiente cuenta como cola no vacía
        let upcoming = match self.queue.pop_front() {
            Some(item) => Some(item),
            None => self.next_pending(),
        };
        if self.pending.is_empty() {
            self.settle_expansion();
        }
        if let Some(item) = upcoming {
            self.lookahead = self.queue.front().cloned();
            if self.start_playback(item.clone()).await.is_ok() {
                return Some(item);
            }
            self.stop().await;
            return None;
        }

        if self.autoplay {
            if let Some(item) = self.suggest_related().await {
                info!("💡 Autoplay: {}", item.title);
                if self.start_playback(item.clone()).await.is_ok() {
                    return Some(item);
                }
            }
        }

        self.stop().await;
        None
    }

    /// Primer track relacionado con el actual que quepa en el límite
    async fn suggest_related(&self) -> Option<MediaItem> {
        let seed = self.current.as_ref()?;
        let ids = match self.resolver.find_related(&seed.id).await {
            Ok(ids) => ids,
            Err(e) => {
                debug!("búsqueda de relacionados falló: {e:#}");
                return None;
            }
        };
        for id in ids {
            match self.resolver.resolve_direct(&id).await {
                Ok(Some(item)) if !item.longer_than(self.config.max_track_duration) => {
                    return Some(item)
                }
                Ok(_) => continue,
                Err(e) => debug!("sugerencia {id} descartada: {e:#}"),
            }
        }
        None
    }

    /// Detiene todo y libera la conexión. Idempotente.
    async fn stop(&mut self) {
        self.cancel.cancel();
        self.pipeline = None;
        if let Some(task) = self.expansion.take() {
            task.abort();
        }
        self.queue.clear();
        self.pending.clear();
        self.lookahead = None;
        self.current = None;
        self.loop_mode = LoopMode::Disabled;
        self.idle.disarm();
        self.bound = None;
        if let Some(conn) = self.connection.take() {
            info!("⏹️ Sesión detenida en guild {}", self.guild_id);
            if let Err(e) = self.transport.disconnect(conn).await {
                warn!("fallo al desconectar: {e:#}");
            }
        }
        self.state = SessionState::Stopped;
    }

    /// Población de playlist en segundo plano.
    ///
    /// El resto de la playlist queda en manos del actor; una tarea
    /// marcapasos solo dicta la cadencia de volcado a la cola.
    fn spawn_expansion(&mut self, tail: Vec<MediaItem>) {
        if let Some(previous) = self.expansion.take() {
            previous.abort();
        }
        self.pending = tail.into();
        if self.pending.is_empty() {
            return;
        }
        let mailbox = self.mailbox.clone();
        self.expansion = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(PLAYLIST_EXPANSION_PACE).await;
                if mailbox.send_async(SessionIntent::ExpansionTick).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Vuelca un pendiente de playlist a la cola en cada pulso
    fn expansion_tick(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Some(item) = self.next_pending() {
            self.queue.append(item);
            self.lookahead = self.queue.front().cloned();
        }
        if self.pending.is_empty() {
            self.settle_expansion();
        }
    }

    /// Siguiente pendiente apto; los que exceden el límite se omiten
    fn next_pending(&mut self) -> Option<MediaItem> {
        while let Some(item) = self.pending.pop_front() {
            if item.longer_than(self.config.max_track_duration) {
                debug!("⏭️ Omitiendo {} (excede el límite de duración)", item.title);
                continue;
            }
            return Some(item);
        }
        None
    }

    fn settle_expansion(&mut self) {
        if let Some(task) = self.expansion.take() {
            task.abort();
            debug!(
                "📜 Playlist completa en la cola de guild {} ({} en cola)",
                self.guild_id,
                self.queue.len()
            );
        }
    }

    /// Chequeo periódico del monitor de inactividad
    async fn idle_check(&mut self) {
        let Some(bound) = self.bound.clone() else {
            return;
        };
        match self.roster.human_members(self.guild_id, bound.id).await {
            Ok(members) if members.is_empty() => {
                info!("👋 Canal {} vacío, desconectando", bound.name);
                self.stop().await;
            }
            Ok(_) => {}
            Err(e) => debug!("chequeo de ocupación falló: {e:#}"),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            current: self.current.clone(),
            lookahead: self.lookahead.clone(),
            queue_titles: self.queue.titles(),
            queue_len: self.queue.len(),
            queue_complete: self.pending.is_empty(),
            queue_pages: self.queue.render_pages(),
            bound_channel: self.bound.clone(),
            connected: self.connection.is_some(),
            loop_mode: self.loop_mode,
            autoplay: self.autoplay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{item, FakeResolver, FakeRoster, FakeTranscoder, FakeTransport};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    struct Harness {
        handle: SessionHandle,
        transport: Arc<FakeTransport>,
        roster: Arc<FakeRoster>,
    }

    fn harness(resolver: FakeResolver) -> Harness {
        harness_with(resolver, SessionConfig::default())
    }

    fn harness_with(resolver: FakeResolver, config: SessionConfig) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let roster = Arc::new(FakeRoster::with_members(&[10, 20]));
        let handle = spawn(
            GuildId::new(99),
            Arc::new(resolver),
            Arc::new(FakeTranscoder),
            transport.clone(),
            roster.clone(),
            config,
            LoopMode::Disabled,
            false,
        );
        Harness {
            handle,
            transport,
            roster,
        }
    }

    fn channel() -> VoiceChannelRef {
        VoiceChannelRef {
            id: ChannelId::new(7),
            name: "General".to_string(),
        }
    }

    fn request(query: &str) -> PlayRequest {
        PlayRequest {
            query: query.to_string(),
            channel: Some(channel()),
            shuffle_playlist: false,
            force_immediate: false,
            requester: UserId::new(10),
        }
    }

    #[tokio::test]
    async fn test_empty_query_rejected_before_resolution() {
        let h = harness(FakeResolver::default());
        let outcome = h.handle.play(request("   ")).await.unwrap();
        assert_eq!(outcome, PlayOutcome::InvalidQuery);
        assert_eq!(h.transport.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_voice_channel_rejected() {
        let h = harness(FakeResolver::default());
        let mut req = request("algo");
        req.channel = None;
        let outcome = h.handle.play(req).await.unwrap();
        assert_eq!(outcome, PlayOutcome::NoVoiceChannel);
    }

    #[tokio::test]
    async fn test_direct_item_over_cap_rejected() {
        let resolver = FakeResolver::default().with_direct(item("largoooooo1", 3601));
        let h = harness(resolver);
        let outcome = h.handle.play(request("largoooooo1")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::TooLong(_)));
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert_eq!(snap.queue_len, 0);
    }

    #[tokio::test]
    async fn test_play_queue_skip_scenario() {
        let resolver = FakeResolver::default()
            .with_direct(item("validid1aaa", 100))
            .with_direct(item("validid2aaa", 100));
        let h = harness(resolver);

        let o1 = h.handle.play(request("validid1aaa")).await.unwrap();
        assert!(matches!(o1, PlayOutcome::Success(ref i) if i.id == "validid1aaa"));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(snap.current.as_ref().unwrap().id, "validid1aaa");

        let o2 = h.handle.play(request("validid2aaa")).await.unwrap();
        assert!(matches!(o2, PlayOutcome::Queued(ref i) if i.id == "validid2aaa"));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.queue_len, 1);
        assert_eq!(snap.lookahead.as_ref().unwrap().id, "validid2aaa");

        let skipped = h.handle.skip().await.unwrap();
        assert_eq!(skipped.unwrap().id, "validid2aaa");
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.current.as_ref().unwrap().id, "validid2aaa");
        assert_eq!(snap.queue_len, 0);
        assert_eq!(snap.state, SessionState::Playing);
    }

    #[tokio::test]
    async fn test_channel_binding_conflict() {
        let resolver = FakeResolver::default()
            .with_direct(item("validid1aaa", 100))
            .with_direct(item("validid2aaa", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();

        let mut req = request("validid2aaa");
        req.channel = Some(VoiceChannelRef {
            id: ChannelId::new(8),
            name: "AFK".to_string(),
        });
        let outcome = h.handle.play(req).await.unwrap();
        assert_eq!(
            outcome,
            PlayOutcome::DifferentVoiceChannels {
                bound: "General".to_string()
            }
        );
        // la cola no se tocó
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.queue_len, 0);
    }

    #[tokio::test]
    async fn test_skip_on_empty_queue_stops_session() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();

        let skipped = h.handle.skip().await.unwrap();
        assert_eq!(skipped, None);
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert_eq!(snap.queue_len, 0);
        assert!(!snap.connected);
        assert_eq!(snap.bound_channel, None);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();
        h.handle.stop().await.unwrap();
        h.handle.stop().await.unwrap();
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_expansion_skips_over_cap_items() {
        let playlist = vec![
            item("cabezaplay1", 100),
            item("colaitem111", 100),
            item("colaitem222", 100),
            item("demasiadolg", 3700),
            item("colaitem333", 100),
        ];
        let resolver = FakeResolver::default().with_playlist("PLtest", playlist);
        let h = harness(resolver);

        let outcome = h.handle.play(request("PLtest")).await.unwrap();
        assert!(
            matches!(outcome, PlayOutcome::PlayingAsPlaylist { ref first, ref resolved }
                if first.id == "cabezaplay1" && resolved.len() == 5)
        );

        // inmediatamente después la población de fondo sigue en curso
        let snap = h.handle.snapshot().await.unwrap();
        assert!(!snap.queue_complete);

        let mut snap = snap;
        for _ in 0..100 {
            if snap.queue_complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            snap = h.handle.snapshot().await.unwrap();
        }
        assert!(snap.queue_complete);
        // 4 aptos en total: 1 sonando + 3 en cola, el largo se omitió
        assert_eq!(snap.queue_len, 3);
        assert_eq!(snap.current.as_ref().unwrap().id, "cabezaplay1");
        assert!(!snap.queue_titles.iter().any(|t| t.contains("demasiadolg")));
    }

    #[tokio::test]
    async fn test_force_immediate_rejects_playlists() {
        let resolver = FakeResolver::default()
            .with_playlist("PLtest", vec![item("aaa11111111", 100), item("bbb11111111", 100)]);
        let h = harness(resolver);
        let mut req = request("PLtest");
        req.force_immediate = true;
        let outcome = h.handle.play(req).await.unwrap();
        assert_eq!(outcome, PlayOutcome::OnlyNonPlaylistAllowed);
    }

    #[tokio::test]
    async fn test_force_immediate_inserts_at_queue_front() {
        let resolver = FakeResolver::default()
            .with_direct(item("validid1aaa", 100))
            .with_direct(item("validid2aaa", 100))
            .with_direct(item("urgente1111", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();
        h.handle.play(request("validid2aaa")).await.unwrap();

        let mut req = request("urgente1111");
        req.force_immediate = true;
        let outcome = h.handle.play(req).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::QueuedFirst(_)));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.lookahead.as_ref().unwrap().id, "urgente1111");
    }

    #[tokio::test]
    async fn test_search_fallback_picks_first_under_cap() {
        let resolver = FakeResolver::default()
            .with_search(vec![item("larguisimoo", 4000), item("cortito1111", 200)]);
        let h = harness(resolver);
        let outcome = h.handle.play(request("lofi beats")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Success(ref i) if i.id == "cortito1111"));
    }

    #[tokio::test]
    async fn test_search_without_results_is_invalid_query() {
        let h = harness(FakeResolver::default());
        let outcome = h.handle.play(request("zzzz inexistente")).await.unwrap();
        assert_eq!(outcome, PlayOutcome::InvalidQuery);
    }

    #[tokio::test]
    async fn test_empty_voice_channel_rejected() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.roster.set_members(&[]);
        let outcome = h.handle.play(request("validid1aaa")).await.unwrap();
        assert_eq!(outcome, PlayOutcome::VoiceChannelEmpty);
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.bound_channel, None);
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.transport.fail_connect.store(true, Ordering::SeqCst);
        let outcome = h.handle.play(request("validid1aaa")).await.unwrap();
        assert_eq!(outcome, PlayOutcome::JoiningChannelFailed);
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert_eq!(snap.current, None);
        assert_eq!(snap.bound_channel, None);

        // tras el rollback la sesión acepta un canal distinto
        h.transport.fail_connect.store(false, Ordering::SeqCst);
        let mut req = request("validid1aaa");
        req.channel = Some(VoiceChannelRef {
            id: ChannelId::new(8),
            name: "Música".to_string(),
        });
        let outcome = h.handle.play(req).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Success(_)));
    }

    #[tokio::test]
    async fn test_loop_song_replays_current() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();
        h.handle.set_loop(LoopMode::Song).await.unwrap();

        h.handle
            .inject(SessionIntent::TrackEnded {
                cancel: CancellationToken::new(),
            })
            .await;
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(snap.current.as_ref().unwrap().id, "validid1aaa");
        // el segundo pipeline corre en su propia tarea; esperar su arranque
        for _ in 0..100 {
            if h.transport.writes.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.transport.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_autoplay_plays_related_on_empty_queue() {
        let resolver = FakeResolver::default()
            .with_direct(item("validid1aaa", 100))
            .with_direct(item("sugerencia1", 100))
            .with_related(&["sugerencia1"]);
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();
        h.handle.set_autoplay(true).await.unwrap();

        let started = h.handle.skip().await.unwrap();
        assert_eq!(started.unwrap().id, "sugerencia1");
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Playing);
    }

    #[tokio::test]
    async fn test_idle_check_disconnects_empty_channel() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let h = harness(resolver);
        h.handle.play(request("validid1aaa")).await.unwrap();

        h.roster.set_members(&[]);
        h.handle.inject(SessionIntent::IdleCheck).await;
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert!(!snap.connected);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_track_ended_after_skip_is_ignored() {
        let resolver = FakeResolver::default()
            .with_direct(item("trackaaaaaa", 100))
            .with_direct(item("trackbbbbbb", 100))
            .with_direct(item("trackcccccc", 100));
        let h = harness(resolver);
        h.handle.play(request("trackaaaaaa")).await.unwrap();
        h.handle.play(request("trackbbbbbb")).await.unwrap();
        h.handle.play(request("trackcccccc")).await.unwrap();

        // el primer track termina justo cuando entra el Skip: su aviso
        // de fin llega detrás, con el token ya cancelado por el salto
        let skipped = h.handle.skip().await.unwrap();
        assert_eq!(skipped.unwrap().id, "trackbbbbbb");
        let stale = CancellationToken::new();
        stale.cancel();
        h.handle
            .inject(SessionIntent::TrackEnded { cancel: stale })
            .await;

        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Playing);
        assert_eq!(snap.current.as_ref().unwrap().id, "trackbbbbbb");
        assert_eq!(snap.queue_len, 1);
    }

    #[tokio::test]
    async fn test_playlist_head_over_cap_rejected() {
        let resolver = FakeResolver::default().with_playlist(
            "PLtest",
            vec![item("cabezalarga", 3700), item("colaitem111", 100)],
        );
        let h = harness(resolver);
        let outcome = h.handle.play(request("PLtest")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::TooLong(ref i) if i.id == "cabezalarga"));
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert_eq!(snap.queue_len, 0);
        assert_eq!(snap.bound_channel, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_join_uses_short_idle_interval() {
        let resolver = FakeResolver::default().with_direct(item("validid1aaa", 100));
        let config = SessionConfig {
            idle_fresh_interval: Duration::from_secs(60),
            idle_playing_interval: Duration::from_secs(100_000),
            ..SessionConfig::default()
        };
        let h = harness_with(resolver, config);
        h.handle.play(request("validid1aaa")).await.unwrap();
        h.roster.set_members(&[]);

        // el primer chequeo tras unirse usa la cadencia corta
        tokio::time::sleep(Duration::from_secs(70)).await;
        let snap = h.handle.snapshot().await.unwrap();
        assert!(snap.state.is_resting());
        assert!(!snap.connected);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_before_expansion_delivers_plays_pending_item() {
        let playlist = vec![
            item("cabezaplay1", 100),
            item("colaitem111", 100),
            item("colaitem222", 100),
        ];
        let resolver = FakeResolver::default().with_playlist("PLtest", playlist);
        let h = harness(resolver);
        h.handle.play(request("PLtest")).await.unwrap();

        // skip inmediato: la población de fondo aún no volcó nada a la
        // cola, pero los pendientes cuentan como cola no vacía
        let skipped = h.handle.skip().await.unwrap();
        assert_eq!(skipped.unwrap().id, "colaitem111");
        let mut snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, SessionState::Playing);

        // el resto de la playlist sigue llegando
        for _ in 0..100 {
            if snap.queue_complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            snap = h.handle.snapshot().await.unwrap();
        }
        assert!(snap.queue_complete);
        assert_eq!(snap.queue_titles, vec!["Track colaitem222".to_string()]);
    }
}
