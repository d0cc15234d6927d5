use anyhow::Result;
use serenity::all::{CommandInteraction, ComponentInteraction, Http};
use serenity::async_trait;
use serenity::builder::{
    CreateActionRow, CreateButton, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage,
};
use serenity::model::application::ButtonStyle;
use std::sync::Arc;

use crate::vote::GatedCommand;

/// Respuesta de un handler, independiente del transporte de interacción
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Mensaje efímero, visible solo para quien invocó el comando
    Ephemeral(String),
    /// Cola paginada: una página por mensaje de seguimiento
    Pages(Vec<String>),
    /// Votación iniciada: texto más botón para emitir votos
    VoteStarted {
        command: GatedCommand,
        required: usize,
        remaining: usize,
    },
}

/// Capacidad única de respuesta de una interacción.
///
/// `reply` responde la interacción (una sola vez); `followup` agrega
/// mensajes posteriores, por ejemplo al resolverse una votación.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn reply(&self, reply: Reply) -> Result<()>;
    async fn followup(&self, reply: Reply) -> Result<()>;
}

fn vote_button(command: GatedCommand) -> CreateActionRow {
    let button = CreateButton::new(format!("vote_{}", command.name()))
        .label("Votar")
        .style(ButtonStyle::Primary)
        .emoji('🗳');
    CreateActionRow::Buttons(vec![button])
}

fn vote_text(command: GatedCommand, required: usize, remaining: usize) -> String {
    format!(
        "🗳️ Votación para `/{}`: {} de {} votos, faltan {}",
        command.name(),
        required - remaining,
        required,
        remaining
    )
}

/// Responder sobre un comando slash
pub struct SlashResponder {
    http: Arc<Http>,
    interaction: CommandInteraction,
}

impl SlashResponder {
    pub fn new(http: Arc<Http>, interaction: CommandInteraction) -> Self {
        Self { http, interaction }
    }
}

#[async_trait]
impl Responder for SlashResponder {
    async fn reply(&self, reply: Reply) -> Result<()> {
        match reply {
            Reply::Text(text) => {
                self.interaction
                    .create_response(
                        &self.http,
                        CreateInteractionResponse::Message(
                            CreateInteractionResponseMessage::new().content(text),
                        ),
                    )
                    .await?;
            }
            Reply::Ephemeral(text) => {
                self.interaction
                    .create_response(
                        &self.http,
                        CreateInteractionResponse::Message(
                            CreateInteractionResponseMessage::new()
                                .content(text)
                                .ephemeral(true),
                        ),
                    )
                    .await?;
            }
            Reply::Pages(pages) => {
                let mut pages = pages.into_iter();
                let first = pages.next().unwrap_or_else(|| "La cola está vacía".to_string());
                self.interaction
                    .create_response(
                        &self.http,
                        CreateInteractionResponse::Message(
                            CreateInteractionResponseMessage::new().content(first),
                        ),
                    )
                    .await?;
                for page in pages {
                    self.interaction
                        .create_followup(
                            &self.http,
                            CreateInteractionResponseFollowup::new().content(page),
                        )
                        .await?;
                }
            }
            Reply::VoteStarted {
                command,
                required,
                remaining,
            } => {
                self.interaction
                    .create_response(
                        &self.http,
                        CreateInteractionResponse::Message(
                            CreateInteractionResponseMessage::new()
                                .content(vote_text(command, required, remaining))
                                .components(vec![vote_button(command)]),
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn followup(&self, reply: Reply) -> Result<()> {
        let builder = match reply {
            Reply::Text(text) => CreateInteractionResponseFollowup::new().content(text),
            Reply::Ephemeral(text) => CreateInteractionResponseFollowup::new()
                .content(text)
                .ephemeral(true),
            Reply::Pages(pages) => {
                for page in pages {
                    self.interaction
                        .create_followup(
                            &self.http,
                            CreateInteractionResponseFollowup::new().content(page),
                        )
                        .await?;
                }
                return Ok(());
            }
            Reply::VoteStarted {
                command,
                required,
                remaining,
            } => CreateInteractionResponseFollowup::new()
                .content(vote_text(command, required, remaining))
                .components(vec![vote_button(command)]),
        };
        self.interaction.create_followup(&self.http, builder).await?;
        Ok(())
    }
}

/// Responder sobre una interacción de componente (botón de voto)
pub struct ComponentResponder {
    http: Arc<Http>,
    interaction: ComponentInteraction,
}

impl ComponentResponder {
    pub fn new(http: Arc<Http>, interaction: ComponentInteraction) -> Self {
        Self { http, interaction }
    }
}

#[async_trait]
impl Responder for ComponentResponder {
    async fn reply(&self, reply: Reply) -> Result<()> {
        let builder = match reply {
            Reply::Text(text) => CreateInteractionResponseMessage::new().content(text),
            Reply::Ephemeral(text) => CreateInteractionResponseMessage::new()
                .content(text)
                .ephemeral(true),
            Reply::Pages(pages) => CreateInteractionResponseMessage::new()
                .content(pages.into_iter().next().unwrap_or_default()),
            Reply::VoteStarted {
                command,
                required,
                remaining,
            } => CreateInteractionResponseMessage::new()
                .content(vote_text(command, required, remaining))
                .components(vec![vote_button(command)]),
        };
        self.interaction
            .create_response(&self.http, CreateInteractionResponse::Message(builder))
            .await?;
        Ok(())
    }

    async fn followup(&self, reply: Reply) -> Result<()> {
        let builder = match reply {
            Reply::Text(text) => CreateInteractionResponseFollowup::new().content(text),
            Reply::Ephemeral(text) => CreateInteractionResponseFollowup::new()
                .content(text)
                .ephemeral(true),
            Reply::Pages(pages) => CreateInteractionResponseFollowup::new()
                .content(pages.into_iter().next().unwrap_or_default()),
            Reply::VoteStarted {
                command,
                required,
                remaining,
            } => CreateInteractionResponseFollowup::new()
                .content(vote_text(command, required, remaining))
                .components(vec![vote_button(command)]),
        };
        self.interaction.create_followup(&self.http, builder).await?;
        Ok(())
    }
}
