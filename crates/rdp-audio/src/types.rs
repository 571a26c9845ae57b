//! Internal sample format and protocol-wide constants.

/// A single stereo frame in the internal pipeline format: two signed
/// 32-bit channels, wide enough that resampling and rate conversion never
/// clip before the final pass down to 16-bit wire samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub left: i32,
    pub right: i32,
}

impl Sample {
    pub const ZERO: Sample = Sample { left: 0, right: 0 };

    pub fn from_i16(left: i16, right: i16) -> Self {
        Self {
            left: i32::from(left),
            right: i32::from(right),
        }
    }

    /// Clip back down to the wire's 16-bit range.
    pub fn to_i16(self) -> (i16, i16) {
        (
            self.left.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16,
            self.right.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16,
        )
    }
}

/// Negotiated wire format. Only `sample_rate_hz` varies at runtime; the
/// subsystem always produces stereo 16-bit PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub const fn internal() -> Self {
        Self {
            sample_rate_hz: INTERNAL_FREQ_HZ,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    pub const fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn avg_bytes_per_sec(&self) -> u32 {
        u32::from(self.block_align()) * self.sample_rate_hz
    }
}

/// Length in milliseconds of one chunk of buffered audio.
pub const CHUNK_MS: u64 = 200;

/// Internal pipeline rate: every chunk the scheduler consumes has already
/// been resampled to this rate by the time it reaches a client channel.
pub const INTERNAL_FREQ_HZ: u32 = 22050;

/// Maximum bytes of PCM data carried in a single WRITE packet's payload.
pub const OUTPUT_BLOCK_SIZE: usize = 8192;

/// Byte capacity of each client's output ring buffer. Must be a multiple
/// of 4 (one stereo 16-bit frame) and large enough to hold several WRITE
/// packets so `send_ready` never has to drop a healthy stream.
pub const RING_BYTES: usize = 128 * 1024;

/// Number of windows averaged by the source-rate-matching loop.
pub const RATE_HISTORY_LEN: usize = 8;

/// Width of the moving average used for client queue-depth feedback.
pub const QUEUE_STATS_LEN: usize = 8;

/// Clamp applied to `dst_freq_hz`: never more than this many Hz away from
/// [`INTERNAL_FREQ_HZ`].
pub const RATE_CLAMP_HZ: i64 = 20;

/// Step size applied to `freq_delta` by the client-sync loop.
pub const FREQ_DELTA_STEP_HZ: i32 = 50;

/// Number of packets dropped on a single overflow episode.
pub const OVERFLOW_SKIP_PACKETS: u32 = 4;

/// Duration, in nanoseconds, that `samples` frames take to play at `freq`
/// Hz. Matches the original integer truncating division exactly: no
/// rounding, no floating point.
pub fn duration_ns(samples: u64, freq: u32) -> u64 {
    samples * 1_000_000_000 / u64::from(freq)
}

/// Rate-correction mode bits, matching `Property/Audio/RateCorrectionMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCorrectionMode(pub u32);

impl RateCorrectionMode {
    pub const RATE_CORRECTION: u32 = 0b001;
    pub const LOW_PASS_FILTER: u32 = 0b010;
    pub const CLIENT_SYNC: u32 = 0b100;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

impl Default for RateCorrectionMode {
    fn default() -> Self {
        RateCorrectionMode(Self::RATE_CORRECTION | Self::LOW_PASS_FILTER)
    }
}
