use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::session::SessionIntent;

/// Temporizador de inactividad de una sesión.
///
/// Dispara chequeos de ocupación periódicos hacia el buzón de la sesión:
/// cadencia corta recién unido al canal y larga durante la reproducción.
/// Se rearma al arrancar cada track y se desarma por completo en Stop,
/// para que no queden callbacks huérfanos deteniendo una sesión ya
/// detenida.
#[derive(Debug, Default)]
pub struct IdleMonitor {
    task: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Rearma el temporizador, cancelando el previo: primer chequeo tras
    /// `first` y los siguientes cada `steady`
    pub(crate) fn arm(
        &mut self,
        first: Duration,
        steady: Duration,
        mailbox: flume::Sender<SessionIntent>,
    ) {
        self.disarm();
        debug!(
            "⏲️ Monitor de inactividad armado: primer chequeo en {}s, luego cada {}s",
            first.as_secs(),
            steady.as_secs()
        );
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(first).await;
            loop {
                if mailbox.send_async(SessionIntent::IdleCheck).await.is_err() {
                    break;
                }
                tokio::time::sleep(steady).await;
            }
        }));
    }

    /// Detiene el temporizador; seguro de llamar repetidamente
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.disarm();
    }
}
