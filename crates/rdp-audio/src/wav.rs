//! Per-client WAV debug capture.
//!
//! Opened on channel attach, written to on every ring-buffer copy, and
//! finalized (rewriting the RIFF header with the final size) on close —
//! mirroring the original's `logwavstart`/`logwav`/`logwavend` life-cycle,
//! including opening the file even for a channel that never streams.

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::WavLogError;
use crate::types::AudioFormat;

pub struct WavLogger {
    writer: Option<WavWriter<std::io::BufWriter<std::fs::File>>>,
}

impl WavLogger {
    pub fn open(dir: &Path, client_id: &str, now_ns: u64, format: AudioFormat) -> Result<Self, WavLogError> {
        let path = file_path(dir, client_id, now_ns);
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate_hz,
            bits_per_sample: format.bits_per_sample,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec).map_err(|source| match source {
            hound::Error::IoError(io) => WavLogError::Create { path: path.display().to_string(), source: io },
            other => WavLogError::Create {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            },
        })?;
        Ok(Self { writer: Some(writer) })
    }

    pub fn write_samples(&mut self, pcm_le_bytes: &[u8]) -> Result<(), WavLogError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for frame in pcm_le_bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([frame[0], frame[1]]);
            writer.write_sample(sample).map_err(|source| WavLogError::Write { source })?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), WavLogError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(|source| WavLogError::Finalize { source })?;
        }
        Ok(())
    }
}

impl Drop for WavLogger {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = self.close();
        }
    }
}

fn file_path(dir: &Path, client_id: &str, now_ns: u64) -> PathBuf {
    dir.join(format!("vrdp-{client_id}-{now_ns:x}.wav"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_matches_expected_format() {
        let path = file_path(Path::new("/tmp"), "client-1", 0xdead_beef);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "vrdp-client-1-deadbeef.wav");
    }
}
