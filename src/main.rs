use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod guild;
mod sources;
mod storage;
#[cfg(test)]
mod testutil;
mod voice;
mod vote;

use crate::audio::session::SessionConfig;
use crate::audio::transcode::FfmpegPipe;
use crate::bot::{MusicBot, RegistryKey};
use crate::config::Config;
use crate::guild::GuildRegistry;
use crate::sources::ytdlp::YtDlpResolver;
use crate::storage::SettingsStore;
use crate::voice::{SerenityRoster, SongbirdTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ritmo_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Ritmo Bot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(MusicBot)
        .register_songbird_with(songbird.clone())
        .await?;

    // Armar el registro de guilds con las piezas reales
    let resolver = Arc::new(YtDlpResolver::with_binary(config.ytdlp_binary.clone())?);
    let transcoder = Arc::new(FfmpegPipe::with_binary(config.ffmpeg_binary.clone()));
    let transport = Arc::new(SongbirdTransport::new(songbird));
    let roster = Arc::new(SerenityRoster::new(client.cache.clone()));
    let store = Arc::new(SettingsStore::new(config.data_dir.clone()).await?);
    let session_config = SessionConfig {
        max_track_duration: Duration::from_secs(config.max_song_duration),
        idle_fresh_interval: Duration::from_secs(config.idle_fresh_secs),
        idle_playing_interval: Duration::from_secs(config.idle_playing_secs),
    };
    let registry = Arc::new(GuildRegistry::new(
        resolver,
        transcoder,
        transport,
        roster,
        store,
        session_config,
        Duration::from_secs(config.vote_timeout_secs),
    ));

    {
        let mut data = client.data.write().await;
        data.insert::<RegistryKey>(registry);
    }

    // Shutdown graceful
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Verifica que las herramientas externas estén disponibles
async fn health_check(config: &Config) -> Result<()> {
    let yt_dlp = tokio::process::Command::new(&config.ytdlp_binary)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = tokio::process::Command::new(&config.ffmpeg_binary)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
