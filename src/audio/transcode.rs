use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::sources::AudioStream;

/// Buffer PCM de formato fijo para el transporte de voz
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBuffer(pub Bytes);

impl PcmBuffer {
    pub const SAMPLE_RATE: u32 = 48_000;
    pub const CHANNELS: u32 = 2;
    const BYTES_PER_SAMPLE: u64 = 2;

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Duración de reproducción del buffer
    pub fn duration(&self) -> Duration {
        let bytes_per_second =
            u64::from(Self::SAMPLE_RATE) * u64::from(Self::CHANNELS) * Self::BYTES_PER_SAMPLE;
        Duration::from_secs_f64(self.0.len() as f64 / bytes_per_second as f64)
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("no se pudo lanzar el transcodificador: {0}")]
    Spawn(std::io::Error),
    #[error("error de E/S durante la transcodificación: {0}")]
    Io(#[from] std::io::Error),
    #[error("el transcodificador terminó con estado {0}")]
    Exit(std::process::ExitStatus),
    #[error("el transcodificador no produjo audio")]
    EmptyOutput,
}

/// Pipe de transcodificación: stream crudo de red → PCM de formato fijo
#[async_trait]
pub trait TranscodePipe: Send + Sync {
    async fn transcode(&self, stream: AudioStream) -> Result<PcmBuffer>;
}

/// Transcodificación con ffmpeg como subproceso (stdin → stdout).
///
/// Salida fija: s16le, 48 kHz, estéreo.
pub struct FfmpegPipe {
    binary: String,
}

impl FfmpegPipe {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg".to_string())
    }

    pub fn with_binary(binary: String) -> Self {
        Self { binary }
    }

    async fn run(&self, mut stream: AudioStream) -> Result<PcmBuffer, TranscodeError> {
        let mut child = Command::new(&self.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "-ac",
                "2",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let mut stdin = child.stdin.take().ok_or(TranscodeError::EmptyOutput)?;
        let mut stdout = child.stdout.take().ok_or(TranscodeError::EmptyOutput)?;

        // Alimentar stdin en paralelo; al soltar stdin se cierra el pipe
        // y ffmpeg termina de vaciar su salida
        let feeder = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stream.reader, &mut stdin).await {
                debug!("stream de entrada cortado: {e}");
            }
        });

        let mut pcm = Vec::new();
        stdout.read_to_end(&mut pcm).await?;
        let status = child.wait().await?;
        let _ = feeder.await;

        if !status.success() {
            return Err(TranscodeError::Exit(status));
        }
        if pcm.is_empty() {
            return Err(TranscodeError::EmptyOutput);
        }
        Ok(PcmBuffer(Bytes::from(pcm)))
    }
}

impl Default for FfmpegPipe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscodePipe for FfmpegPipe {
    async fn transcode(&self, stream: AudioStream) -> Result<PcmBuffer> {
        let pcm = self.run(stream).await?;
        debug!(
            "🎚️ Transcodificados {} bytes ({:.1}s de audio)",
            pcm.len(),
            pcm.duration().as_secs_f64()
        );
        if pcm.duration() < Duration::from_millis(20) {
            warn!("buffer PCM sospechosamente corto");
        }
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pcm_duration() {
        // 1 segundo de s16le estéreo a 48 kHz = 192000 bytes
        let pcm = PcmBuffer(Bytes::from(vec![0u8; 192_000]));
        assert_eq!(pcm.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_buffer() {
        let pcm = PcmBuffer(Bytes::new());
        assert!(pcm.is_empty());
        assert_eq!(pcm.duration(), Duration::ZERO);
    }
}
