// RDPSND audio output pipeline for cosmic-ext-rdp-server.
//
// Chunks guest PCM into 200ms windows, rate-corrects them against wall
// clock and client drain speed, resamples through `rubato`, and drives
// one RDPSND channel state machine per connected client:
// - chunk.rs: buffering and due-time scheduling of guest samples
// - rate.rs: source-rate and client-sync adaptive control loops
// - resampler.rs: the rate-conversion kernel (rubato-backed)
// - scheduler.rs: the periodic tick that drains chunks and converts them
// - client.rs: per-client ring buffer, block-ID sequencing, close handshake
// - wire.rs: RDPSND packet encode/decode
// - wav.rs: optional per-client debug capture
// - engine.rs: ties the above together behind a single lock

pub mod chunk;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod rate;
pub mod resampler;
pub mod scheduler;
pub mod types;
pub mod wav;
pub mod wire;

pub use config::AudioConfig;
pub use engine::{AudioEngine, StatsSink};
pub use error::AudioError;
pub use scheduler::TickOutput;
pub use types::{AudioFormat, Sample};
