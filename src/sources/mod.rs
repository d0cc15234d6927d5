pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use ytdlp::YtDlpResolver;

/// Un track ya resuelto, listo para encolar o reproducir.
/// Inmutable una vez creado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    /// Identificador opaco de la plataforma (p. ej. id de video)
    pub id: String,
    pub title: String,
    pub author: String,
    /// Desconocida para directos o videos sin listar
    pub duration: Option<Duration>,
    pub url: String,
}

impl MediaItem {
    /// Verifica si el track excede el límite de duración dado.
    /// Sin duración conocida se asume que cabe.
    pub fn longer_than(&self, limit: Duration) -> bool {
        self.duration.map_or(false, |d| d > limit)
    }
}

/// Stream de audio crudo tal como llega de la red.
/// Se consume una sola vez, alimentando el pipe de transcodificación.
pub struct AudioStream {
    pub reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl AudioStream {
    pub fn new(reader: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }
}

/// Trait común para resolver consultas en tracks reproducibles
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resuelve una referencia directa (id o URL de video).
    /// `Ok(None)` significa "no es una referencia directa".
    async fn resolve_direct(&self, reference: &str) -> Result<Option<MediaItem>>;

    /// Resuelve una referencia de playlist en sus miembros, en orden.
    /// Lista vacía significa "no es una playlist".
    async fn resolve_playlist(&self, reference: &str) -> Result<Vec<MediaItem>>;

    /// Búsqueda de texto libre, candidatos en orden de relevancia
    async fn search(&self, text: &str) -> Result<Vec<MediaItem>>;

    /// Ids de tracks relacionados con uno dado (para autoplay)
    async fn find_related(&self, item_id: &str) -> Result<Vec<String>>;

    /// Abre el stream de audio descargable de un track
    async fn open_stream(&self, item: &MediaItem) -> Result<AudioStream>;
}
