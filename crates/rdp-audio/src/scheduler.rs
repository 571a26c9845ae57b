//! Component C: the output scheduler.
//!
//! A single cooperative tick function, called on a nominal 100ms period
//! by whatever async runtime the embedder uses. Holds no transport
//! state itself — it drains due chunks, runs the resampler, and hands
//! the result to the caller to fan out to clients.

use crate::chunk::ChunkList;
use crate::rate::RateCorrection;
use crate::resampler::Resampler;
use crate::types::{Sample, CHUNK_MS};

/// What the scheduler produced this tick, for the caller to broadcast.
pub enum TickOutput {
    /// Nothing to do yet.
    Idle,
    /// Resampled audio ready for every connected client.
    Samples { samples: Vec<Sample>, samples_start_ns: u64, is_end: bool },
    /// Keep-alive pulse: no audio, stream not finished.
    KeepAlive,
    /// True end-of-stream: broadcast once, then the rate engine resets.
    EndOfStream,
}

pub struct Scheduler {
    finished: bool,
    finished_ts_ms: Option<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { finished: false, finished_ts_ms: None }
    }

    /// Advance the schedule by one tick. `chunks` and `rate` are expected
    /// to be held under the caller's single `audio_lock` for the portion
    /// of this call that touches them; `resampler.convert` runs with the
    /// chunk already removed from the list so no I/O happens while the
    /// lock is held (enforced by the caller draining before invoking the
    /// resampler, matching the drain-then-drop-lock-then-send pattern).
    pub fn tick(
        &mut self,
        now_ms: u64,
        chunks: &mut ChunkList,
        rate: &mut RateCorrection,
        resampler: &mut dyn Resampler,
    ) -> Vec<TickOutput> {
        if now_ms == 0 {
            return Vec::new();
        }

        if chunks.is_empty() {
            if self.finished {
                if now_ms.saturating_sub(self.finished_ts_ms.unwrap_or(0)) > 1000 {
                    self.finished = false;
                    rate.reset_after_stream_end();
                    resampler.stop();
                    return vec![TickOutput::EndOfStream];
                }
                return Vec::new();
            }
            return vec![TickOutput::KeepAlive];
        }

        self.finished = false;
        let due = chunks.drain_due(now_ms);
        let mut outputs = Vec::with_capacity(due.len());
        for chunk in due {
            let target_hz = rate.resampler_target_hz();
            if let Err(e) = resampler.update(chunk.src_freq, target_hz) {
                tracing::warn!("resampler update failed: {e}");
            }
            match resampler.convert(&chunk.buffer) {
                Ok(samples) => outputs.push(TickOutput::Samples {
                    samples,
                    samples_start_ns: chunk.samples_start_ns,
                    is_end: false,
                }),
                Err(e) => {
                    tracing::warn!("resampler convert failed, dropping chunk: {e}");
                }
            }
        }

        if chunks.is_empty() {
            self.finished = true;
            self.finished_ts_ms = Some(now_ms);
        }

        outputs
    }

    pub fn next_wake_ms(&self, event_ms: u64) -> u64 {
        event_ms + CHUNK_MS / 2
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RateCorrectionMode;

    struct NoopResampler;
    impl Resampler for NoopResampler {
        fn start(&mut self, _: u32, _: u32, _: bool) -> Result<(), crate::error::ResamplerError> {
            Ok(())
        }
        fn update(&mut self, _: u32, _: u32) -> Result<(), crate::error::ResamplerError> {
            Ok(())
        }
        fn convert(&mut self, input: &[Sample]) -> Result<Vec<Sample>, crate::error::ResamplerError> {
            Ok(input.to_vec())
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn first_tick_is_a_no_op() {
        let mut sched = Scheduler::new();
        let mut chunks = ChunkList::new();
        let mut rate = RateCorrection::new(RateCorrectionMode::default());
        let mut resampler = NoopResampler;
        let out = sched.tick(0, &mut chunks, &mut rate, &mut resampler);
        assert!(out.is_empty());
    }

    #[test]
    fn empty_list_yields_keepalive_until_pause_elapses() {
        let mut sched = Scheduler::new();
        let mut chunks = ChunkList::new();
        let mut rate = RateCorrection::new(RateCorrectionMode::default());
        let mut resampler = NoopResampler;
        let out = sched.tick(100, &mut chunks, &mut rate, &mut resampler);
        assert!(matches!(out[0], TickOutput::KeepAlive));
    }

    #[test]
    fn due_chunk_is_converted_and_emitted() {
        let mut sched = Scheduler::new();
        let mut chunks = ChunkList::new();
        let mut rate = RateCorrection::new(RateCorrectionMode::default());
        let mut resampler = NoopResampler;
        chunks.append_samples(&vec![Sample::ZERO; 10], 22050, 0, 0);
        let out = sched.tick(400, &mut chunks, &mut rate, &mut resampler);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], TickOutput::Samples { .. }));
    }
}
