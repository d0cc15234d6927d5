use anyhow::Result;
use serenity::all::{GuildId, UserId};
use serenity::builder::{CreateCommand, CreateCommandOption};
use serenity::model::application::CommandOptionType;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audio::queue::format_duration;
use crate::audio::session::{
    LoopMode, PlayOutcome, PlayRequest, SessionState, VoiceChannelRef,
};
use crate::bot::reply::{Reply, Responder};
use crate::guild::{GuildContext, GuildRegistry};
use crate::sources::MediaItem;
use crate::voice::VoiceTransport;
use crate::vote::{Approval, BallotOutcome, GatedCommand, VoteVerdict};

/// Invocación normalizada: los handlers no ven la interacción cruda
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub name: String,
    pub guild_id: GuildId,
    pub requester: UserId,
    /// Canal de voz actual del solicitante, si está en uno
    pub voice_channel: Option<VoiceChannelRef>,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
    pub value: ArgValue,
}

#[derive(Debug, Clone)]
pub enum ArgValue {
    Str(String),
    Bool(bool),
}

impl CommandInvocation {
    fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.iter().find(|a| a.name == name).and_then(|a| match &a.value {
            ArgValue::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    fn bool_arg(&self, name: &str) -> bool {
        self.args
            .iter()
            .find(|a| a.name == name)
            .map(|a| matches!(a.value, ArgValue::Bool(true)))
            .unwrap_or(false)
    }
}

/// Qué hace cada comando; el despacho es una tabla explícita, no reflexión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Play,
    Gated(GatedCommand),
    Queue,
    NowPlaying,
    Shuffle,
    Loop,
    Autoplay,
    /// Emisión de un voto, llega por botón de componente
    CastVote,
}

struct CommandDescriptor {
    name: &'static str,
    kind: CommandKind,
    create: Option<fn() -> CreateCommand>,
}

/// Tabla de comandos, construida una vez al arranque
fn registry_table() -> &'static [CommandDescriptor] {
    &[
        CommandDescriptor {
            name: "play",
            kind: CommandKind::Play,
            create: Some(play_command),
        },
        CommandDescriptor {
            name: "skip",
            kind: CommandKind::Gated(GatedCommand::Skip),
            create: Some(skip_command),
        },
        CommandDescriptor {
            name: "stop",
            kind: CommandKind::Gated(GatedCommand::Stop),
            create: Some(stop_command),
        },
        CommandDescriptor {
            name: "queue",
            kind: CommandKind::Queue,
            create: Some(queue_command),
        },
        CommandDescriptor {
            name: "nowplaying",
            kind: CommandKind::NowPlaying,
            create: Some(nowplaying_command),
        },
        CommandDescriptor {
            name: "shuffle",
            kind: CommandKind::Shuffle,
            create: Some(shuffle_command),
        },
        CommandDescriptor {
            name: "loop",
            kind: CommandKind::Loop,
            create: Some(loop_command),
        },
        CommandDescriptor {
            name: "autoplay",
            kind: CommandKind::Autoplay,
            create: Some(autoplay_command),
        },
        // sin registro en Discord: se sintetiza desde los botones de voto
        CommandDescriptor {
            name: "vote",
            kind: CommandKind::CastVote,
            create: None,
        },
    ]
}

/// Comandos slash a registrar en Discord
pub fn slash_commands() -> Vec<CreateCommand> {
    registry_table().iter().filter_map(|d| d.create).map(|f| f()).collect()
}

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción, playlist o búsqueda")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "shuffle",
            "Mezclar la playlist al cargar",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "next",
            "Insertar al frente de la cola",
        ))
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción (requiere mayoría)")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop")
        .description("Detiene la reproducción y limpia la cola (requiere mayoría)")
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Muestra la cola de reproducción")
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra la canción actual y la siguiente")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola de reproducción")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Configura el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                .add_string_choice("Desactivar", "off")
                .add_string_choice("Canción", "song")
                .required(true),
        )
}

fn autoplay_command() -> CreateCommand {
    CreateCommand::new("autoplay")
        .description("Activa/desactiva el autoplay al vaciarse la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Boolean,
                "enabled",
                "Sugerir canciones relacionadas al terminar la cola",
            )
            .required(true),
        )
}

/// Despacha una invocación ya normalizada al handler que corresponde
pub async fn dispatch<V: VoiceTransport>(
    registry: Arc<GuildRegistry<V>>,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let Some(descriptor) = registry_table().iter().find(|d| d.name == invocation.name) else {
        return responder
            .reply(Reply::Ephemeral("❌ Comando no reconocido".to_string()))
            .await;
    };

    info!(
        "📝 Comando /{} de {} en guild {}",
        invocation.name, invocation.requester, invocation.guild_id
    );

    let context = registry.context(invocation.guild_id).await;
    match descriptor.kind {
        CommandKind::Play => handle_play(context, invocation, responder).await,
        CommandKind::Gated(command) => {
            handle_gated(registry, context, command, invocation, responder).await
        }
        CommandKind::Queue => handle_queue(context, responder).await,
        CommandKind::NowPlaying => handle_nowplaying(context, responder).await,
        CommandKind::Shuffle => handle_shuffle(context, responder).await,
        CommandKind::Loop => handle_loop(context, invocation, responder).await,
        CommandKind::Autoplay => handle_autoplay(context, invocation, responder).await,
        CommandKind::CastVote => handle_cast_vote(context, invocation, responder).await,
    }
}

async fn handle_play(
    context: Arc<GuildContext>,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let Some(query) = invocation.str_arg("query") else {
        return responder
            .reply(Reply::Ephemeral("❌ Falta el término de búsqueda".to_string()))
            .await;
    };

    // resolver puede tardar más que la ventana de respuesta de Discord
    responder.reply(Reply::Text("🔍 Buscando...".to_string())).await?;

    let request = PlayRequest {
        query: query.to_string(),
        channel: invocation.voice_channel.clone(),
        shuffle_playlist: invocation.bool_arg("shuffle"),
        force_immediate: invocation.bool_arg("next"),
        requester: invocation.requester,
    };
    let outcome = context.session.play(request).await?;
    responder.followup(reply_for_outcome(&outcome)).await
}

/// Traduce cada resultado de reproducción a exactamente una respuesta
fn reply_for_outcome(outcome: &PlayOutcome) -> Reply {
    match outcome {
        PlayOutcome::Success(item) => Reply::Text(format!("🎵 Reproduciendo: {}", describe(item))),
        PlayOutcome::PlayingAsPlaylist { first, resolved } => Reply::Text(format!(
            "🎵 Reproduciendo: {} (+{} de la playlist en camino)",
            describe(first),
            resolved.len()
        )),
        PlayOutcome::Queued(item) => Reply::Text(format!("➕ Agregado a la cola: {}", describe(item))),
        PlayOutcome::QueuedFirst(item) => {
            Reply::Text(format!("⏫ Siguiente en la cola: {}", describe(item)))
        }
        PlayOutcome::QueuedAsPlaylist { first, resolved } => Reply::Text(format!(
            "➕ Agregado a la cola: {} (+{} de la playlist en camino)",
            describe(first),
            resolved.len()
        )),
        PlayOutcome::InvalidQuery => {
            Reply::Ephemeral("❌ No encontré nada reproducible para esa consulta".to_string())
        }
        PlayOutcome::TooLong(item) => Reply::Ephemeral(format!(
            "❌ {} excede la duración máxima permitida",
            describe(item)
        )),
        PlayOutcome::OnlyNonPlaylistAllowed => Reply::Ephemeral(
            "❌ La opción `next` solo acepta canciones sueltas, no playlists".to_string(),
        ),
        PlayOutcome::NoVoiceChannel => {
            Reply::Ephemeral("❌ Debes estar en un canal de voz para reproducir".to_string())
        }
        PlayOutcome::DifferentVoiceChannels { bound } => Reply::Ephemeral(format!(
            "❌ Ya estoy reproduciendo en **{bound}**; únete a ese canal"
        )),
        PlayOutcome::VoiceChannelEmpty => {
            Reply::Ephemeral("❌ Tu canal de voz quedó vacío".to_string())
        }
        PlayOutcome::JoiningChannelFailed => {
            Reply::Ephemeral("❌ No pude conectarme a tu canal de voz".to_string())
        }
        PlayOutcome::StreamFailed => {
            Reply::Ephemeral("❌ No pude obtener el audio de esa canción".to_string())
        }
    }
}

fn describe(item: &MediaItem) -> String {
    match item.duration {
        Some(duration) => format!("**{}** - {} ({})", item.title, item.author, format_duration(duration)),
        None => format!("**{}** - {}", item.title, item.author),
    }
}

async fn handle_gated<V: VoiceTransport>(
    registry: Arc<GuildRegistry<V>>,
    context: Arc<GuildContext>,
    command: GatedCommand,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let snapshot = context.session.snapshot().await?;
    if snapshot.state != SessionState::Playing {
        return responder
            .reply(Reply::Ephemeral("❌ No hay nada reproduciéndose".to_string()))
            .await;
    }
    let Some(bound) = snapshot.bound_channel else {
        return responder
            .reply(Reply::Ephemeral("❌ No hay nada reproduciéndose".to_string()))
            .await;
    };
    if invocation.voice_channel.as_ref().map(|c| c.id) != Some(bound.id) {
        return responder
            .reply(Reply::Ephemeral(format!(
                "❌ Debes estar en **{}** para usar /{}",
                bound.name,
                command.name()
            )))
            .await;
    }

    let eligible = registry
        .roster()
        .human_members(invocation.guild_id, bound.id)
        .await?;
    match context
        .votes
        .request_approval(command, bound.id, &eligible, invocation.requester)
    {
        Approval::Granted => {
            let reply = execute_gated(&context, command).await?;
            responder.reply(reply).await
        }
        Approval::Pending(pending) => {
            responder
                .reply(Reply::VoteStarted {
                    command,
                    required: pending.required,
                    remaining: pending.remaining,
                })
                .await?;

            // el comando diferido espera el veredicto en segundo plano
            let context = context.clone();
            tokio::spawn(async move {
                match pending.resolve().await {
                    VoteVerdict::Approved => match execute_gated(&context, command).await {
                        Ok(reply) => {
                            if let Err(e) = responder.followup(reply).await {
                                warn!("No pude anunciar el resultado de la votación: {e:?}");
                            }
                        }
                        Err(e) => error!("Error ejecutando /{} aprobado: {e:?}", command.name()),
                    },
                    VoteVerdict::TimedOut => {
                        let reply = Reply::Text(format!(
                            "⏳ La votación para `/{}` expiró sin mayoría",
                            command.name()
                        ));
                        if let Err(e) = responder.followup(reply).await {
                            warn!("No pude anunciar la expiración de la votación: {e:?}");
                        }
                    }
                    // la invocación nueva ya tiene su propio mensaje
                    VoteVerdict::Superseded => {}
                }
            });
            Ok(())
        }
    }
}

async fn execute_gated(context: &GuildContext, command: GatedCommand) -> Result<Reply> {
    match command {
        GatedCommand::Skip => {
            let next = context.session.skip().await?;
            Ok(match next {
                Some(item) => Reply::Text(format!("⏭️ Saltado. Ahora: {}", describe(&item))),
                None => Reply::Text("⏭️ Saltado. La cola quedó vacía".to_string()),
            })
        }
        GatedCommand::Stop => {
            context.session.stop().await?;
            Ok(Reply::Text("⏹️ Reproducción detenida y cola limpia".to_string()))
        }
    }
}

async fn handle_cast_vote(
    context: Arc<GuildContext>,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let Some(command) = invocation.str_arg("command").and_then(GatedCommand::from_name) else {
        return responder
            .reply(Reply::Ephemeral("❌ Votación no reconocida".to_string()))
            .await;
    };

    let voter_channel = invocation.voice_channel.as_ref().map(|c| c.id);
    let outcome = context
        .votes
        .cast_ballot(command, invocation.requester, voter_channel);
    let reply = match outcome {
        BallotOutcome::Counted { remaining } => {
            Reply::Text(format!("🗳️ Voto contado, faltan {remaining}"))
        }
        BallotOutcome::Approved => Reply::Text(format!(
            "✅ Mayoría alcanzada, ejecutando `/{}`",
            command.name()
        )),
        BallotOutcome::AlreadyVoted => Reply::Ephemeral("🗳️ Tu voto ya estaba contado".to_string()),
        BallotOutcome::NotEligible => Reply::Ephemeral(
            "❌ Debes estar en el canal de voz de la votación para votar".to_string(),
        ),
        BallotOutcome::NoActiveVote => {
            Reply::Ephemeral("❌ Esa votación ya no está activa".to_string())
        }
    };
    responder.reply(reply).await
}

async fn handle_queue(context: Arc<GuildContext>, responder: Arc<dyn Responder>) -> Result<()> {
    let snapshot = context.session.snapshot().await?;
    if snapshot.queue_len == 0 {
        let text = match &snapshot.current {
            Some(item) => format!("🎵 Sonando: {}. La cola está vacía", describe(item)),
            None => "La cola está vacía".to_string(),
        };
        return responder.reply(Reply::Text(text)).await;
    }

    let mut pages = snapshot.queue_pages;
    if !snapshot.queue_complete {
        if let Some(last) = pages.last_mut() {
            last.push_str("\n⏳ ...la playlist sigue cargando");
        }
    }
    responder.reply(Reply::Pages(pages)).await
}

async fn handle_nowplaying(
    context: Arc<GuildContext>,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let snapshot = context.session.snapshot().await?;
    let reply = match snapshot.current {
        Some(item) => {
            let mut text = format!("🎵 Sonando: {}", describe(&item));
            if snapshot.loop_mode == LoopMode::Song {
                text.push_str("\n🔂 Repitiendo esta canción");
            } else if let Some(next) = snapshot.lookahead {
                text.push_str(&format!("\n⏭️ Siguiente: {}", describe(&next)));
            }
            Reply::Text(text)
        }
        None => Reply::Text("No hay nada reproduciéndose".to_string()),
    };
    responder.reply(reply).await
}

async fn handle_shuffle(context: Arc<GuildContext>, responder: Arc<dyn Responder>) -> Result<()> {
    let shuffled = context.session.shuffle().await?;
    let reply = if shuffled == 0 {
        Reply::Ephemeral("❌ No hay cola que mezclar".to_string())
    } else {
        Reply::Text(format!("🔀 Cola mezclada ({shuffled} canciones)"))
    };
    responder.reply(reply).await
}

async fn handle_loop(
    context: Arc<GuildContext>,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let mode = match invocation.str_arg("mode") {
        Some("song") => LoopMode::Song,
        Some("off") => LoopMode::Disabled,
        _ => {
            return responder
                .reply(Reply::Ephemeral("❌ Modo de repetición no válido".to_string()))
                .await;
        }
    };
    context.set_loop_mode(mode).await?;
    let text = match mode {
        LoopMode::Song => "🔂 Repitiendo la canción actual",
        LoopMode::Disabled => "➡️ Repetición desactivada",
    };
    responder.reply(Reply::Text(text.to_string())).await
}

async fn handle_autoplay(
    context: Arc<GuildContext>,
    invocation: CommandInvocation,
    responder: Arc<dyn Responder>,
) -> Result<()> {
    let enabled = invocation.bool_arg("enabled");
    context.set_autoplay(enabled).await?;
    let text = if enabled {
        "♾️ Autoplay activado: sugeriré canciones al vaciarse la cola"
    } else {
        "♾️ Autoplay desactivado"
    };
    responder.reply(Reply::Text(text.to_string())).await
}
