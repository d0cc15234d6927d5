use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::sources::MediaItem;

/// Límite de caracteres por página (límite de campo de embed de Discord)
pub const PAGE_CHAR_LIMIT: usize = 1024;

/// Cola de tracks pendientes de una sesión.
///
/// Orden de inserción = orden de reproducción (FIFO), con inserción al
/// frente y shuffle explícitos. Se permiten duplicados. La cola pertenece
/// en exclusiva al actor de la sesión: un solo escritor, sin locks.
#[derive(Debug, Default)]
pub struct QueueStore {
    items: VecDeque<MediaItem>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Agrega un track al final de la cola
    pub fn append(&mut self, item: MediaItem) {
        info!("➕ Agregado a la cola: {}", item.title);
        self.items.push_back(item);
    }

    /// Inserta un track al frente (se reproducirá el próximo)
    pub fn insert_front(&mut self, item: MediaItem) {
        info!("⏫ Insertado al frente de la cola: {}", item.title);
        self.items.push_front(item);
    }

    /// Saca el próximo track en orden FIFO
    pub fn pop_front(&mut self) -> Option<MediaItem> {
        self.items.pop_front()
    }

    /// Mira el próximo track sin sacarlo
    pub fn front(&self) -> Option<&MediaItem> {
        self.items.front()
    }

    /// Vacía la cola
    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            debug!("🗑️ Cola vaciada ({} tracks)", self.items.len());
        }
        self.items.clear();
    }

    /// Mezcla los tracks pendientes
    pub fn shuffle(&mut self) {
        let mut items: Vec<_> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);
        info!("🔀 Cola mezclada");
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Títulos en orden de reproducción
    pub fn titles(&self) -> Vec<String> {
        self.items.iter().map(|i| i.title.clone()).collect()
    }

    /// Renderiza la cola en páginas acotadas por caracteres.
    ///
    /// Empaque voraz: una entrada que desbordaría la página actual abre
    /// una nueva. Determinista para el orden actual; se recalcula en cada
    /// llamada, nunca se cachea entre mutaciones.
    pub fn render_pages(&self) -> Vec<String> {
        let mut pages = Vec::new();
        let mut page = String::new();

        for (index, item) in self.items.iter().enumerate() {
            let entry = render_entry(index + 1, item);
            if !page.is_empty() && page.len() + 1 + entry.len() > PAGE_CHAR_LIMIT {
                pages.push(std::mem::take(&mut page));
            }
            if !page.is_empty() {
                page.push('\n');
            }
            page.push_str(&entry);
        }
        if !page.is_empty() {
            pages.push(page);
        }
        pages
    }
}

fn render_entry(index: usize, item: &MediaItem) -> String {
    match item.duration {
        Some(d) => format!(
            "{}. {} - {} ({}) [{}]",
            index,
            item.title,
            item.author,
            format_duration(d),
            item.url
        ),
        None => format!("{}. {} - {} [{}]", index, item.title, item.author, item.url),
    }
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
