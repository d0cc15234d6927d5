use anyhow::Result;
use std::path::PathBuf;

/// Configuración del bot, leída del entorno (y de `.env` si existe)
#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,

    // Paths
    pub data_dir: PathBuf,

    // Límites
    pub max_song_duration: u64, // En segundos
    pub vote_timeout_secs: u64,

    // Desconexión por inactividad
    pub idle_playing_secs: u64,
    pub idle_fresh_secs: u64,

    // Herramientas externas
    pub ytdlp_binary: String,
    pub ffmpeg_binary: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),

            // Límites
            max_song_duration: std::env::var("MAX_SONG_DURATION")
                .unwrap_or_else(|_| "3600".to_string()) // 1 hora
                .parse()?,
            vote_timeout_secs: std::env::var("VOTE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            // Inactividad
            idle_playing_secs: std::env::var("IDLE_PLAYING_SECS")
                .unwrap_or_else(|_| "300".to_string()) // 5 minutos
                .parse()?,
            idle_fresh_secs: std::env::var("IDLE_FRESH_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            // Herramientas externas
            ytdlp_binary: std::env::var("YTDLP_BINARY").unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_binary: std::env::var("FFMPEG_BINARY").unwrap_or_else(|_| "ffmpeg".to_string()),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN cannot be empty");
        }

        if self.application_id == 0 {
            anyhow::bail!("APPLICATION_ID must be a valid Discord application id");
        }

        if self.max_song_duration == 0 {
            anyhow::bail!("Max song duration must be greater than 0");
        }

        if self.idle_playing_secs == 0 || self.idle_fresh_secs == 0 {
            anyhow::bail!("Idle intervals must be greater than 0");
        }

        Ok(())
    }

    /// Resumen seguro de la configuración para los logs (sin token)
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {}\n  \
            Data: {}\n  \
            Limits: {}s max duration, {}s vote timeout\n  \
            Idle: {}s playing, {}s fresh\n  \
            Tools: {} / {}",
            self.application_id,
            self.data_dir.display(),
            self.max_song_duration,
            self.vote_timeout_secs,
            self.idle_playing_secs,
            self.idle_fresh_secs,
            self.ytdlp_binary,
            self.ffmpeg_binary,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Config {
        Config {
            discord_token: "token".to_string(),
            application_id: 1234,
            data_dir: "./data".into(),
            max_song_duration: 3600,
            vote_timeout_secs: 60,
            idle_playing_secs: 300,
            idle_fresh_secs: 60,
            ytdlp_binary: "yt-dlp".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_sane_values() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_token() {
        let mut config = sample();
        config.discord_token = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = sample();
        config.max_song_duration = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.idle_fresh_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_omits_token() {
        let summary = sample().summary();
        assert!(!summary.contains("token"));
        assert!(summary.contains("1234"));
    }
}
