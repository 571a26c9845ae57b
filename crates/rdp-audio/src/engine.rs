//! Top-level audio engine: owns AudioData (chunk list + rate engine +
//! resampler) behind a single mutex, and the client registry.
//!
//! This replaces the original's process-global `AudioData`/client list
//! with a value constructed at server init and passed around as a
//! handle, per the design notes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::chunk::ChunkList;
use crate::client::{ClientChannel, OutboundPacket};
use crate::config::AudioConfig;
use crate::rate::RateCorrection;
use crate::resampler::{Resampler, RubatoResampler};
use crate::scheduler::{Scheduler, TickOutput};
use crate::types::{AudioFormat, Sample};
use crate::wav::WavLogger;

/// Everything the `audio_lock` mutex guards: the chunk list, the
/// rate-correction state, and the resampler handle. Never held across an
/// I/O call.
struct AudioData {
    chunks: ChunkList,
    rate: RateCorrection,
    resampler: Box<dyn Resampler>,
}

/// Hooks for an embedder to observe pipeline stages without the core
/// depending on a metrics crate. Default implementation is a no-op.
pub trait StatsSink: Send + Sync {
    fn on_start_samples(&self, _src_freq: u32) {}
    fn on_append_samples(&self, _count: usize) {}
    fn on_convert_samples(&self, _count: usize) {}
    fn on_end_samples(&self) {}
}

struct NoopStats;
impl StatsSink for NoopStats {}

struct ClientEntry {
    channel: ClientChannel,
    wav: Option<WavLogger>,
}

pub struct AudioEngine {
    audio: Mutex<AudioData>,
    clients: Mutex<HashMap<u64, ClientEntry>>,
    scheduler: Mutex<Scheduler>,
    config: AudioConfig,
    stats: Box<dyn StatsSink>,
}

impl AudioEngine {
    pub fn new(config: AudioConfig) -> Self {
        Self::with_stats(config, Box::new(NoopStats))
    }

    pub fn with_stats(config: AudioConfig, stats: Box<dyn StatsSink>) -> Self {
        Self {
            audio: Mutex::new(AudioData {
                chunks: ChunkList::new(),
                rate: RateCorrection::new(config.mode()),
                resampler: Box::new(RubatoResampler::new()),
            }),
            clients: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(Scheduler::new()),
            config,
            stats,
        }
    }

    /// Producer entry point. Never returns an error: resource exhaustion
    /// is logged and the submission is dropped.
    pub fn submit_samples(&self, samples: &[Sample], src_freq: u32, now_ms: u64, now_ns: u64) {
        let mut audio = match self.audio.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.stats.on_append_samples(samples.len());

        let started_new_segment = audio.chunks.append_samples(samples, src_freq, now_ms, now_ns);
        if started_new_segment {
            self.stats.on_start_samples(src_freq);
            let target = audio.rate.resampler_target_hz();
            let lpf = audio.rate.low_pass_filter_enabled();
            if let Err(e) = audio.resampler.start(src_freq, target, lpf) {
                tracing::warn!("failed to start resampler: {e}");
            }
        }

        audio.rate.observe_submission(samples.len() as u64, src_freq, now_ns);
        let target = audio.rate.resampler_target_hz();
        if let Err(e) = audio.resampler.update(src_freq, target) {
            tracing::warn!("failed to update resampler: {e}");
        }
    }

    pub fn register_client(&self, client_id: u64, now_ns: u64, format: AudioFormat) {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        let wav = self.config.log_path.as_ref().and_then(|dir| {
            match WavLogger::open(dir, &client_id.to_string(), now_ns, format) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!("failed to open wav log for client {client_id}: {e}");
                    None
                }
            }
        });
        let mut channel = ClientChannel::new(format);
        channel.attach();
        clients.insert(client_id, ClientEntry { channel, wav });
    }

    pub fn remove_client(&self, client_id: u64) {
        self.clients.lock().unwrap_or_else(|p| p.into_inner()).remove(&client_id);
    }

    pub fn begin_negotiate(&self, client_id: u64) -> Option<Vec<u8>> {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        clients.get_mut(&client_id).map(|c| c.channel.begin_negotiate())
    }

    pub fn on_wire_packet(&self, client_id: u64, bytes: &[u8]) -> Vec<OutboundPacket> {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = clients.get_mut(&client_id) else {
            return Vec::new();
        };
        match entry.channel.on_wire_packet(bytes) {
            Ok(out) => {
                if let Some(avg) = entry.channel.take_avg_queue_depth() {
                    drop(clients);
                    let mut audio = self.audio.lock().unwrap_or_else(|p| p.into_inner());
                    audio.rate.on_client_queue_depth(avg);
                }
                out
            }
            Err(e) => {
                tracing::warn!("protocol violation from client {client_id}: {e}");
                Vec::new()
            }
        }
    }

    /// Run Components A-C only: drain due chunks and resample them,
    /// without touching the client registry. For embedders that hand
    /// the resulting PCM to a transport that owns its own channel state
    /// machine (e.g. `ironrdp-rdpsnd`) instead of using [`Self::tick`]'s
    /// built-in Components D/E.
    pub fn drain_resampled(&self, now_ms: u64) -> Vec<TickOutput> {
        let mut audio = self.audio.lock().unwrap_or_else(|p| p.into_inner());
        let mut scheduler = self.scheduler.lock().unwrap_or_else(|p| p.into_inner());
        let AudioData { chunks, rate, resampler } = &mut *audio;
        scheduler.tick(now_ms, chunks, rate, resampler.as_mut())
    }

    /// Run one scheduler tick. Returns, per client, the wire packets to
    /// transmit. The resampler and chunk work happen with the lock held;
    /// fan-out to clients happens after it's dropped.
    pub fn tick(&self, now_ms: u64) -> HashMap<u64, Vec<OutboundPacket>> {
        let tick_outputs = {
            let mut audio = self.audio.lock().unwrap_or_else(|p| p.into_inner());
            let mut scheduler = self.scheduler.lock().unwrap_or_else(|p| p.into_inner());
            let AudioData { chunks, rate, resampler } = &mut *audio;
            scheduler.tick(now_ms, chunks, rate, resampler.as_mut())
        };

        let mut results = HashMap::new();
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());

        for output in tick_outputs {
            match output {
                TickOutput::Idle | TickOutput::KeepAlive => {
                    for (id, entry) in clients.iter_mut() {
                        let out = entry.channel.enqueue(&[], now_ms * 1_000_000, false);
                        results.entry(*id).or_insert_with(Vec::new).extend(out);
                    }
                }
                TickOutput::EndOfStream => {
                    self.stats.on_end_samples();
                    for (id, entry) in clients.iter_mut() {
                        let out = entry.channel.enqueue(&[], now_ms * 1_000_000, true);
                        if let Some(wav) = entry.wav.as_mut() {
                            if let Err(e) = wav.close() {
                                tracing::warn!("failed to close wav log for client {id}: {e}");
                            }
                        }
                        results.entry(*id).or_insert_with(Vec::new).extend(out);
                    }
                }
                TickOutput::Samples { samples, samples_start_ns, is_end } => {
                    self.stats.on_convert_samples(samples.len());
                    let mut wire = Vec::with_capacity(samples.len() * 4);
                    for s in &samples {
                        let (l, r) = s.to_i16();
                        wire.extend_from_slice(&l.to_le_bytes());
                        wire.extend_from_slice(&r.to_le_bytes());
                    }
                    for (id, entry) in clients.iter_mut() {
                        if let Some(wav) = entry.wav.as_mut() {
                            if let Err(e) = wav.write_samples(&wire) {
                                tracing::warn!("failed to write wav samples for client {id}: {e}");
                            }
                        }
                        let out = entry.channel.enqueue(&samples, samples_start_ns, is_end);
                        results.entry(*id).or_insert_with(Vec::new).extend(out);
                    }
                }
            }
        }

        results
    }
}
