use serde::Deserialize;
use std::path::PathBuf;

use crate::types::RateCorrectionMode;

/// Audio output configuration, loaded as the `[audio]` section of the
/// server's TOML config (`Property/Audio/*` in the original naming).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Bitset: bit 0 rate correction, bit 1 low-pass filter, bit 2
    /// client-sync. Default `0b011` (rate correction + low-pass, no
    /// client-sync).
    pub rate_correction_mode: u32,

    /// When set, each client's output stream is also captured to a WAV
    /// file in this directory for offline inspection.
    pub log_path: Option<PathBuf>,
}

impl AudioConfig {
    pub fn mode(&self) -> RateCorrectionMode {
        RateCorrectionMode(self.rate_correction_mode)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            rate_correction_mode: RateCorrectionMode::default().0,
            log_path: None,
        }
    }
}
