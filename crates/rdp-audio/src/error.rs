//! Error kinds for the audio output pipeline.
//!
//! None of these are fatal to the subsystem: every call site logs and
//! falls back per the handling documented on each variant, rather than
//! propagating a failure back to the VM producer.

/// A client sent a malformed or unexpected RDPSND packet.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet too short: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unsupported NEGOTIATE response: expected 1 format, client offered {offered}")]
    UnsupportedFormatCount { offered: u16 },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    #[error("completion for block {block_id} while none were outstanding")]
    UnexpectedCompletion { block_id: u8 },
}

/// Errors raised while bringing up or tearing down the debug WAV logger.
#[derive(Debug, thiserror::Error)]
pub enum WavLogError {
    #[error("failed to create wav file at {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write wav samples: {source}")]
    Write {
        #[source]
        source: hound::Error,
    },

    #[error("failed to finalize wav file: {source}")]
    Finalize {
        #[source]
        source: hound::Error,
    },
}

/// Errors raised by the resampler adapter.
#[derive(Debug, thiserror::Error)]
pub enum ResamplerError {
    #[error("failed to construct resampler for {src_hz}Hz -> {dst_hz}Hz: {source}")]
    Construct {
        src_hz: u32,
        dst_hz: u32,
        #[source]
        source: rubato::ResamplerConstructionError,
    },

    #[error("resample failed: {source}")]
    Process {
        #[source]
        source: rubato::ResampleError,
    },
}

/// Top-level error type surfaced by fallible `rdp-audio` entry points.
///
/// `AudioEngine::submit_samples` never returns this: resource exhaustion
/// there is logged and the submission is dropped, matching the producer
/// interface's void return.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("protocol violation")]
    Protocol(#[from] ProtocolError),

    #[error("resampler error")]
    Resampler(#[from] ResamplerError),

    #[error("wav logging error")]
    WavLog(#[from] WavLogError),

    #[error("configuration error: {0}")]
    Config(String),
}
