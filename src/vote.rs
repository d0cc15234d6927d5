use parking_lot::Mutex;
use serenity::all::{ChannelId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub const DEFAULT_VOTE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MIN_VOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Comandos privilegiados que requieren aprobación por mayoría
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatedCommand {
    Skip,
    Stop,
}

impl GatedCommand {
    pub fn name(self) -> &'static str {
        match self {
            GatedCommand::Skip => "skip",
            GatedCommand::Stop => "stop",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "skip" => Some(GatedCommand::Skip),
            "stop" => Some(GatedCommand::Stop),
            _ => None,
        }
    }
}

/// Resultado final de una votación pendiente
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteVerdict {
    Approved,
    TimedOut,
    /// Reemplazada por una invocación nueva del mismo comando; se
    /// descarta en silencio
    Superseded,
}

/// Resultado de emitir un voto individual
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotOutcome {
    Counted { remaining: usize },
    /// El mismo usuario no puede contar dos veces
    AlreadyVoted,
    /// El voto completó la mayoría
    Approved,
    /// El votante ya no está en el canal de voz de la votación
    NotEligible,
    NoActiveVote,
}

/// Respuesta inmediata a una petición de aprobación
pub enum Approval {
    /// Mayoría trivial (≤1 voto requerido): ejecutar sin votación ni UI
    Granted,
    Pending(PendingVote),
}

struct ActiveVote {
    serial: u64,
    required: usize,
    channel: ChannelId,
    voters: HashSet<UserId>,
    done: Option<oneshot::Sender<VoteVerdict>>,
}

type VoteMap = Arc<Mutex<HashMap<GatedCommand, ActiveVote>>>;

/// Registro de votaciones de una guild: a lo sumo una activa por comando.
///
/// La espera del resultado es una señal de un solo disparo, no un loop de
/// sondeo: completar la mayoría, expirar o reemplazar la votación
/// resuelven al que espera sin carreras.
pub struct VoteBoard {
    votes: VoteMap,
    timeout: Duration,
    serial: AtomicU64,
}

impl VoteBoard {
    /// `timeout` se acota por debajo al piso de 30 segundos
    pub fn new(timeout: Duration) -> Self {
        Self {
            votes: Arc::new(Mutex::new(HashMap::new())),
            timeout: timeout.max(MIN_VOTE_TIMEOUT),
            serial: AtomicU64::new(1),
        }
    }

    /// Mayoría simple: más de la mitad de los presentes
    pub fn required_votes(eligible: usize) -> usize {
        eligible.div_ceil(2)
    }

    /// Pide aprobación para un comando privilegiado.
    ///
    /// El solicitante queda sembrado como primer voto. Una votación
    /// previa del mismo comando se descarta y reemplaza por completo.
    pub fn request_approval(
        &self,
        command: GatedCommand,
        channel: ChannelId,
        eligible_voters: &[UserId],
        requester: UserId,
    ) -> Approval {
        let required = Self::required_votes(eligible_voters.len());
        if required <= 1 {
            debug!("✅ /{} auto-aprobado ({} elegibles)", command.name(), eligible_voters.len());
            return Approval::Granted;
        }

        let mut votes = self.votes.lock();
        if let Some(mut old) = votes.remove(&command) {
            if let Some(tx) = old.done.take() {
                let _ = tx.send(VoteVerdict::Superseded);
            }
            debug!("♻️ Votación previa de /{} reemplazada", command.name());
        }

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut voters = HashSet::new();
        voters.insert(requester);
        votes.insert(
            command,
            ActiveVote {
                serial,
                required,
                channel,
                voters,
                done: Some(tx),
            },
        );
        info!(
            "🗳️ Votación iniciada para /{}: {} de {} votos requeridos",
            command.name(),
            required,
            eligible_voters.len()
        );
        Approval::Pending(PendingVote {
            command,
            required,
            remaining: required - 1,
            serial,
            votes: self.votes.clone(),
            timeout: self.timeout,
            rx,
        })
    }

    /// Emite un voto. `voter_channel` es el canal de voz actual del
    /// votante, para verificar que sigue siendo miembro del canal de la
    /// votación.
    pub fn cast_ballot(
        &self,
        command: GatedCommand,
        voter: UserId,
        voter_channel: Option<ChannelId>,
    ) -> BallotOutcome {
        let mut votes = self.votes.lock();
        let Some(vote) = votes.get_mut(&command) else {
            return BallotOutcome::NoActiveVote;
        };
        if voter_channel != Some(vote.channel) {
            return BallotOutcome::NotEligible;
        }
        if !vote.voters.insert(voter) {
            return BallotOutcome::AlreadyVoted;
        }
        let remaining = vote.required.saturating_sub(vote.voters.len());
        if remaining == 0 {
            if let Some(tx) = vote.done.take() {
                let _ = tx.send(VoteVerdict::Approved);
            }
            votes.remove(&command);
            info!("✅ Votación de /{} aprobada", command.name());
            return BallotOutcome::Approved;
        }
        BallotOutcome::Counted { remaining }
    }

    /// Estado de la votación activa, si la hay: (requeridos, restantes)
    pub fn active(&self, command: GatedCommand) -> Option<(usize, usize)> {
        let votes = self.votes.lock();
        votes
            .get(&command)
            .map(|v| (v.required, v.required.saturating_sub(v.voters.len())))
    }
}

impl Default for VoteBoard {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_TIMEOUT)
    }
}

/// Asa de una votación en curso; esperar el veredicto consume el asa
pub struct PendingVote {
    pub command: GatedCommand,
    pub required: usize,
    pub remaining: usize,
    serial: u64,
    votes: VoteMap,
    timeout: Duration,
    rx: oneshot::Receiver<VoteVerdict>,
}

impl PendingVote {
    /// Espera la resolución. Si expira el plazo, la votación pendiente
    /// se retira del registro y el comando diferido queda descartado.
    pub async fn resolve(self) -> VoteVerdict {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(verdict)) => verdict,
            // el emisor se descartó junto con la votación
            Ok(Err(_)) => VoteVerdict::Superseded,
            Err(_) => {
                let mut votes = self.votes.lock();
                if votes.get(&self.command).map(|v| v.serial) == Some(self.serial) {
                    votes.remove(&self.command);
                }
                info!("⏳ Votación de /{} expirada", self.command.name());
                VoteVerdict::TimedOut
            }
        }
    }
}
