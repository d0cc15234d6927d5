use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::session::LoopMode;

/// Ajustes persistidos de una guild, un archivo JSON por guild.
///
/// Se leen una vez al crear el contexto y se escriben en cada cambio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildSettings {
    pub guild_id: u64,
    pub auto_play: bool,
    pub loop_type: u8,
}

impl GuildSettings {
    pub fn defaults_for(guild_id: u64) -> Self {
        Self {
            guild_id,
            auto_play: false,
            loop_type: LoopMode::Disabled.code(),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        LoopMode::from_code(self.loop_type)
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_type = mode.code();
    }
}

/// Almacenamiento de ajustes basado en archivos JSON
pub struct SettingsStore {
    data_dir: PathBuf,
}

impl SettingsStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        info!("📁 Ajustes de guild en: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Carga los ajustes de una guild; archivo ausente, ilegible o con
    /// guildId que no coincide equivale a "sin ajustes guardados".
    pub async fn load(&self, guild_id: u64) -> GuildSettings {
        let path = self.path_for(guild_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => {
                debug!("sin ajustes guardados para guild {guild_id}");
                return GuildSettings::defaults_for(guild_id);
            }
        };
        match serde_json::from_str::<GuildSettings>(&content) {
            Ok(settings) if settings.guild_id == guild_id => settings,
            Ok(settings) => {
                warn!(
                    "guildId {} no coincide en {}, usando valores por defecto",
                    settings.guild_id,
                    path.display()
                );
                GuildSettings::defaults_for(guild_id)
            }
            Err(e) => {
                warn!("ajustes corruptos para guild {guild_id}: {e}");
                GuildSettings::defaults_for(guild_id)
            }
        }
    }

    /// Persiste los ajustes de una guild
    pub async fn save(&self, settings: &GuildSettings) -> Result<()> {
        let path = self.path_for(settings.guild_id);
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&path, content).await?;
        debug!("💾 Ajustes guardados para guild {}", settings.guild_id);
        Ok(())
    }

    fn path_for(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join(format!("guild_{guild_id}.json"))
    }
}
