use serenity::all::{
    CommandDataOptionValue, CommandInteraction, ComponentInteraction, Context, EventHandler,
    GuildId, Interaction, Ready, UserId, VoiceState,
};
use serenity::async_trait;
use serenity::prelude::TypeMapKey;
use std::sync::Arc;
use tracing::{error, info};

pub mod commands;
pub mod reply;

use crate::audio::session::VoiceChannelRef;
use crate::bot::commands::{Arg, ArgValue, CommandInvocation};
use crate::bot::reply::{ComponentResponder, SlashResponder};
use crate::guild::GuildRegistry;
use crate::voice::SongbirdTransport;

/// Registro de guilds compartido vía el `TypeMap` del cliente
pub struct RegistryKey;

impl TypeMapKey for RegistryKey {
    type Value = Arc<GuildRegistry<SongbirdTransport>>;
}

/// Handler principal de eventos de Discord.
///
/// Se mantiene delgado: normaliza la interacción y delega al despacho
/// de comandos; todo el estado vive en el registro de guilds.
pub struct MusicBot;

impl MusicBot {
    async fn registry(ctx: &Context) -> Option<Arc<GuildRegistry<SongbirdTransport>>> {
        let data = ctx.data.read().await;
        data.get::<RegistryKey>().cloned()
    }
}

/// Canal de voz actual de un usuario, según la caché de la gateway
fn caller_voice_channel(ctx: &Context, guild_id: GuildId, user: UserId) -> Option<VoiceChannelRef> {
    let guild = ctx.cache.guild(guild_id)?;
    let channel_id = guild.voice_states.get(&user).and_then(|vs| vs.channel_id)?;
    let name = guild
        .channels
        .get(&channel_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "canal de voz".to_string());
    Some(VoiceChannelRef {
        id: channel_id,
        name,
    })
}

fn slash_invocation(ctx: &Context, command: &CommandInteraction, guild_id: GuildId) -> CommandInvocation {
    let args = command
        .data
        .options
        .iter()
        .filter_map(|opt| {
            let value = match &opt.value {
                CommandDataOptionValue::String(s) => ArgValue::Str(s.clone()),
                CommandDataOptionValue::Boolean(b) => ArgValue::Bool(*b),
                _ => return None,
            };
            Some(Arg {
                name: opt.name.clone(),
                value,
            })
        })
        .collect();

    CommandInvocation {
        name: command.data.name.clone(),
        guild_id,
        requester: command.user.id,
        voice_channel: caller_voice_channel(ctx, guild_id, command.user.id),
        args,
    }
}

/// Los botones de voto se sintetizan como la invocación `vote`
fn ballot_invocation(
    ctx: &Context,
    component: &ComponentInteraction,
    guild_id: GuildId,
) -> Option<CommandInvocation> {
    let command = component.data.custom_id.strip_prefix("vote_")?;
    Some(CommandInvocation {
        name: "vote".to_string(),
        guild_id,
        requester: component.user.id,
        voice_channel: caller_voice_channel(ctx, guild_id, component.user.id),
        args: vec![Arg {
            name: "command".to_string(),
            value: ArgValue::Str(command.to_string()),
        }],
    })
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        info!("📝 Registrando comandos slash...");
        for command in commands::slash_commands() {
            if let Err(e) = ctx.http.create_global_command(&command).await {
                error!("❌ Error registrando comandos globales: {e:?}");
                return;
            }
        }
        info!("✅ Comandos globales registrados");
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Some(registry) = Self::registry(&ctx).await else {
            error!("Registro de guilds no inicializado");
            return;
        };

        match interaction {
            Interaction::Command(command) => {
                let Some(guild_id) = command.guild_id else {
                    return;
                };
                let invocation = slash_invocation(&ctx, &command, guild_id);
                let responder = Arc::new(SlashResponder::new(ctx.http.clone(), command));
                if let Err(e) = commands::dispatch(registry, invocation, responder).await {
                    error!("Error manejando comando: {e:?}");
                }
            }
            Interaction::Component(component) => {
                let Some(guild_id) = component.guild_id else {
                    return;
                };
                let Some(invocation) = ballot_invocation(&ctx, &component, guild_id) else {
                    return;
                };
                let responder = Arc::new(ComponentResponder::new(ctx.http.clone(), component));
                if let Err(e) = commands::dispatch(registry, invocation, responder).await {
                    error!("Error manejando componente: {e:?}");
                }
            }
            _ => {}
        }
    }

    /// Si expulsan al bot del canal de voz, la sesión vuelve a reposo
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };
        info!("🔌 Bot desconectado del canal de voz en guild {guild_id}");

        let Some(registry) = Self::registry(&ctx).await else {
            return;
        };
        let context = registry.context(guild_id).await;
        if let Err(e) = context.session.stop().await {
            error!("Error al detener la sesión tras la desconexión: {e:?}");
        }
    }
}
