use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use super::{AudioStream, MediaItem, MediaResolver};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const SEARCH_RESULTS: usize = 5;

fn video_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap())
}

/// Resolución de consultas mediante el binario yt-dlp.
///
/// Metadatos vía `yt-dlp -j`, URLs de audio vía `yt-dlp -g` y descarga
/// del stream con reqwest. Cada subproceso corre con timeout propio.
pub struct YtDlpResolver {
    binary: String,
    http: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new() -> Result<Self> {
        Self::with_binary("yt-dlp".to_string())
    }

    pub fn with_binary(binary: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { binary, http })
    }

    /// Detecta si la referencia es un video concreto (id u URL de watch)
    pub fn is_direct_reference(reference: &str) -> bool {
        if video_id_re().is_match(reference) {
            return true;
        }
        let Ok(parsed) = Url::parse(reference) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let is_youtube = host == "www.youtube.com"
            || host == "youtube.com"
            || host == "m.youtube.com"
            || host == "music.youtube.com";
        if host == "youtu.be" {
            return true;
        }
        is_youtube
            && parsed.path() == "/watch"
            && parsed.query_pairs().any(|(k, _)| k == "v")
    }

    /// Detecta si la referencia apunta a una playlist
    pub fn is_playlist_reference(reference: &str) -> bool {
        if reference.starts_with("PL") && reference.len() > 13 {
            return true;
        }
        match Url::parse(reference) {
            Ok(parsed) => parsed.query_pairs().any(|(k, _)| k == "list"),
            Err(_) => false,
        }
    }

    fn watch_url(reference: &str) -> String {
        if video_id_re().is_match(reference) {
            format!("https://www.youtube.com/watch?v={reference}")
        } else {
            reference.to_string()
        }
    }

    /// Ejecuta yt-dlp y devuelve stdout como texto
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            SUBPROCESS_TIMEOUT,
            Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .context("timeout ejecutando yt-dlp")?
        .context("no se pudo lanzar yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp terminó con error: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve_direct(&self, reference: &str) -> Result<Option<MediaItem>> {
        if !Self::is_direct_reference(reference) {
            return Ok(None);
        }
        let url = Self::watch_url(reference);
        debug!("🔎 Resolviendo referencia directa: {url}");
        let stdout = self.run(&["-j", "--no-playlist", &url]).await?;
        let entry: YtEntry =
            serde_json::from_str(stdout.trim()).context("respuesta de yt-dlp no parseable")?;
        Ok(Some(entry.into_item()))
    }

    async fn resolve_playlist(&self, reference: &str) -> Result<Vec<MediaItem>> {
        if !Self::is_playlist_reference(reference) {
            return Ok(Vec::new());
        }
        let url = if reference.starts_with("PL") {
            format!("https://www.youtube.com/playlist?list={reference}")
        } else {
            reference.to_string()
        };
        info!("📜 Resolviendo playlist: {url}");
        let stdout = self.run(&["-J", "--flat-playlist", &url]).await?;
        let listing: YtPlaylist =
            serde_json::from_str(stdout.trim()).context("playlist de yt-dlp no parseable")?;
        Ok(listing
            .entries
            .into_iter()
            .map(YtEntry::into_item)
            .collect())
    }

    async fn search(&self, text: &str) -> Result<Vec<MediaItem>> {
        let query = format!("ytsearch{SEARCH_RESULTS}:{text}");
        debug!("🔎 Buscando: {text}");
        let stdout = self.run(&["-j", "--no-playlist", &query]).await?;
        // Un objeto JSON por línea, uno por resultado
        let mut items = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<YtEntry>(line) {
                Ok(entry) => items.push(entry.into_item()),
                Err(e) => warn!("resultado de búsqueda descartado: {e}"),
            }
        }
        Ok(items)
    }

    async fn find_related(&self, item_id: &str) -> Result<Vec<String>> {
        // El mix automático de YouTube (lista RD) sirve como fuente de sugerencias
        let url = format!("https://www.youtube.com/watch?v={item_id}&list=RD{item_id}");
        let stdout = self.run(&["-J", "--flat-playlist", &url]).await?;
        let listing: YtPlaylist =
            serde_json::from_str(stdout.trim()).context("mix de yt-dlp no parseable")?;
        Ok(listing
            .entries
            .into_iter()
            .map(|e| e.id)
            .filter(|id| id != item_id)
            .collect())
    }

    async fn open_stream(&self, item: &MediaItem) -> Result<AudioStream> {
        info!("🎵 Abriendo stream de audio: {}", item.title);
        let stdout = self.run(&["-g", "-f", "bestaudio/best", &item.url]).await?;
        let audio_url = stdout
            .lines()
            .next()
            .context("yt-dlp no devolvió URL de audio")?
            .trim()
            .to_string();

        let response = self
            .http
            .get(&audio_url)
            .send()
            .await
            .context("fallo al pedir el stream de audio")?
            .error_for_status()?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(AudioStream::new(StreamReader::new(Box::pin(stream))))
    }
}

#[derive(Debug, Deserialize)]
struct YtEntry {
    id: String,
    title: String,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    webpage_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtPlaylist {
    #[serde(default)]
    entries: Vec<YtEntry>,
}

impl YtEntry {
    fn into_item(self) -> MediaItem {
        let url = self
            .webpage_url
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.id));
        MediaItem {
            author: self
                .uploader
                .or(self.channel)
                .unwrap_or_else(|| "Desconocido".to_string()),
            duration: self
                .duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(Duration::from_secs_f64),
            id: self.id,
            title: self.title,
            url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_direct_reference_detection() {
        assert!(YtDlpResolver::is_direct_reference("dQw4w9WgXcQ"));
        assert!(YtDlpResolver::is_direct_reference(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        ));
        assert!(YtDlpResolver::is_direct_reference(
            "https://youtu.be/dQw4w9WgXcQ"
        ));
        assert!(!YtDlpResolver::is_direct_reference("lofi hip hop radio"));
        assert!(!YtDlpResolver::is_direct_reference(
            "https://example.com/video"
        ));
    }

    #[test]
    fn test_playlist_reference_detection() {
        assert!(YtDlpResolver::is_playlist_reference(
            "https://www.youtube.com/playlist?list=PLabc"
        ));
        assert!(YtDlpResolver::is_playlist_reference(
            "PL590L5WQmH8dpP0RyH5pCfIaDEdt9nk7r"
        ));
        assert!(!YtDlpResolver::is_playlist_reference("dQw4w9WgXcQ"));
        assert!(!YtDlpResolver::is_playlist_reference("una búsqueda normal"));
    }

    #[test]
    fn test_entry_parsing() {
        let json = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","uploader":"Rick Astley","duration":212.0,"webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ"}"#;
        let entry: YtEntry = serde_json::from_str(json).unwrap();
        let item = entry.into_item();
        assert_eq!(item.id, "dQw4w9WgXcQ");
        assert_eq!(item.author, "Rick Astley");
        assert_eq!(item.duration, Some(Duration::from_secs(212)));
    }

    #[test]
    fn test_entry_without_duration() {
        // Entradas de flat-playlist o directos pueden venir sin duración ni uploader
        let json = r#"{"id":"abc123def45","title":"Directo 24/7"}"#;
        let entry: YtEntry = serde_json::from_str(json).unwrap();
        let item = entry.into_item();
        assert_eq!(item.duration, None);
        assert_eq!(item.author, "Desconocido");
        assert_eq!(item.url, "https://www.youtube.com/watch?v=abc123def45");
    }
}
