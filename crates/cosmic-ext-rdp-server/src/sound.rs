//! RDPSND audio forwarding backend.
//!
//! Captures desktop audio via `PipeWire`, runs it through `rdp-audio`'s
//! chunking/rate-correction/resampling pipeline (Components A-C), and
//! forwards the result to the RDP client over the RDPSND virtual channel
//! via `ironrdp-rdpsnd`, which owns the wire-level block-ID bookkeeping
//! and close handshake for this integration (see DESIGN.md).

use std::sync::Arc;

use ironrdp_rdpsnd::pdu::{AudioFormat as WireAudioFormat, ClientAudioFormatPdu, WaveFormat};
use ironrdp_server::{
    RdpsndServerHandler, RdpsndServerMessage, ServerEvent, ServerEventSender, SoundServerFactory,
};
use rdp_audio::{AudioConfig, AudioEngine, AudioFormat, Sample, TickOutput};
use rdp_capture::{AudioChunk, PwAudioStream};
use tokio::sync::mpsc;

const TICK_PERIOD_MS: u64 = 100;

fn bytes_to_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(4)
        .map(|f| Sample::from_i16(i16::from_le_bytes([f[0], f[1]]), i16::from_le_bytes([f[2], f[3]])))
        .collect()
}

fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        let (l, r) = s.to_i16();
        out.extend_from_slice(&l.to_le_bytes());
        out.extend_from_slice(&r.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Handler (one per RDP connection)
// ---------------------------------------------------------------------------

/// RDPSND handler that captures audio from `PipeWire`, runs it through
/// the shared [`AudioEngine`], and sends wave data to the RDP client.
#[derive(Debug)]
pub struct PipelinedAudioHandler {
    formats: Vec<WireAudioFormat>,
    channels: u16,
    sample_rate: u32,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    engine: Arc<AudioEngine>,
    audio_stream: Option<PwAudioStream>,
    pump_abort: Option<tokio::sync::oneshot::Sender<()>>,
    tick_abort: Option<tokio::sync::oneshot::Sender<()>>,
}

impl PipelinedAudioHandler {
    fn new(
        channels: u16,
        sample_rate: u32,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        engine: Arc<AudioEngine>,
    ) -> Self {
        // The wire format we advertise must match what drain_resampled()
        // actually produces, which is always resampled to the internal
        // pipeline rate, not the capture device's rate.
        let internal_rate = AudioFormat::internal().sample_rate_hz;
        let block_align = channels * 2;
        let avg_bytes_per_sec = u32::from(block_align) * internal_rate;

        let formats = vec![WireAudioFormat {
            format: WaveFormat::PCM,
            n_channels: channels,
            n_samples_per_sec: internal_rate,
            n_avg_bytes_per_sec: avg_bytes_per_sec,
            n_block_align: block_align,
            bits_per_sample: 16,
            data: None,
        }];

        Self {
            formats,
            channels,
            sample_rate,
            event_tx,
            engine,
            audio_stream: None,
            pump_abort: None,
            tick_abort: None,
        }
    }

    /// Feed captured chunks into the engine's chunk list (Component A).
    fn start_capture_pump(&self, mut audio_rx: mpsc::Receiver<AudioChunk>) -> tokio::sync::oneshot::Sender<()> {
        let engine = Arc::clone(&self.engine);
        let (abort_tx, mut abort_rx) = tokio::sync::oneshot::channel();

        let rt = tokio::runtime::Handle::current();
        rt.spawn(async move {
            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => {
                        let Some(chunk) = chunk else {
                            tracing::debug!("Audio capture channel closed");
                            break;
                        };
                        let now_ms = chunk.sequence * 1000 / u64::from(chunk.sample_rate);
                        let now_ns = now_ms * 1_000_000;
                        let samples = bytes_to_samples(&chunk.data);
                        engine.submit_samples(&samples, chunk.sample_rate, now_ms, now_ns);
                    }
                    _ = &mut abort_rx => {
                        tracing::debug!("Audio capture pump aborted");
                        break;
                    }
                }
            }
        });

        abort_tx
    }

    /// Drain the engine's scheduler on a 100ms cadence (Components B/C)
    /// and forward resampled PCM as RDPSND Wave messages, letting
    /// `ironrdp-rdpsnd` handle block IDs and the close handshake.
    fn start_tick_pump(&self) -> tokio::sync::oneshot::Sender<()> {
        let engine = Arc::clone(&self.engine);
        let event_tx = self.event_tx.clone();
        let (abort_tx, mut abort_rx) = tokio::sync::oneshot::channel();

        let rt = tokio::runtime::Handle::current();
        rt.spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(TICK_PERIOD_MS));
            let mut now_ms: u64 = 0;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        now_ms += TICK_PERIOD_MS;
                        for output in engine.drain_resampled(now_ms) {
                            if let TickOutput::Samples { samples, samples_start_ns, .. } = output {
                                let data = samples_to_bytes(&samples);
                                #[allow(clippy::cast_possible_truncation)]
                                let ts = (samples_start_ns / 1_000_000) as u32;
                                let msg = RdpsndServerMessage::Wave(data, ts);
                                if event_tx.send(ServerEvent::Rdpsnd(msg)).is_err() {
                                    tracing::debug!("Sound event channel closed");
                                    return;
                                }
                            }
                        }
                    }
                    _ = &mut abort_rx => {
                        tracing::debug!("Audio tick pump aborted");
                        return;
                    }
                }
            }
        });

        abort_tx
    }
}

impl RdpsndServerHandler for PipelinedAudioHandler {
    fn get_formats(&self) -> &[WireAudioFormat] {
        &self.formats
    }

    fn start(&mut self, _client_format: &ClientAudioFormatPdu) -> Option<u16> {
        tracing::info!(
            channels = self.channels,
            sample_rate = self.sample_rate,
            "Starting audio capture for RDPSND"
        );

        match PwAudioStream::start(self.channels, self.sample_rate, 32) {
            Ok((stream, audio_rx)) => {
                self.pump_abort = Some(self.start_capture_pump(audio_rx));
                self.tick_abort = Some(self.start_tick_pump());
                self.audio_stream = Some(stream);
                Some(0)
            }
            Err(e) => {
                tracing::warn!("Failed to start PipeWire audio capture: {e}");
                None
            }
        }
    }

    fn stop(&mut self) {
        tracing::info!("Stopping audio capture");
        if let Some(abort) = self.pump_abort.take() {
            let _ = abort.send(());
        }
        if let Some(abort) = self.tick_abort.take() {
            let _ = abort.send(());
        }
        if let Some(mut stream) = self.audio_stream.take() {
            stream.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Factory (shared across connections)
// ---------------------------------------------------------------------------

/// Factory that creates [`PipelinedAudioHandler`] instances for each RDP
/// connection. All handlers share one [`AudioEngine`], since the
/// underlying `PipeWire` source and its rate-correction state are
/// process-wide, not per connection.
#[derive(Debug)]
pub struct PipelinedAudioFactory {
    channels: u16,
    sample_rate: u32,
    event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    engine: Arc<AudioEngine>,
}

impl PipelinedAudioFactory {
    pub fn new(channels: u16, sample_rate: u32, config: AudioConfig) -> Self {
        Self {
            channels,
            sample_rate,
            event_tx: None,
            engine: Arc::new(AudioEngine::new(config)),
        }
    }

    pub fn internal_format() -> AudioFormat {
        AudioFormat::internal()
    }
}

impl ServerEventSender for PipelinedAudioFactory {
    fn set_sender(&mut self, sender: mpsc::UnboundedSender<ServerEvent>) {
        self.event_tx = Some(sender);
    }
}

impl SoundServerFactory for PipelinedAudioFactory {
    fn build_backend(&self) -> Box<dyn RdpsndServerHandler> {
        let tx = self
            .event_tx
            .clone()
            .expect("set_sender must be called before build_backend");
        Box::new(PipelinedAudioHandler::new(
            self.channels,
            self.sample_rate,
            tx,
            Arc::clone(&self.engine),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_format_valid() {
        let handler = PipelinedAudioHandler::new(
            2,
            44100,
            mpsc::unbounded_channel().0,
            Arc::new(AudioEngine::new(AudioConfig::default())),
        );
        let formats = handler.get_formats();
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].format, WaveFormat::PCM);
        assert_eq!(formats[0].n_channels, 2);
        // Must match the internal pipeline rate drain_resampled() actually
        // emits, not the PipeWire capture rate passed to `new`.
        assert_eq!(formats[0].n_samples_per_sec, AudioFormat::internal().sample_rate_hz);
        assert_eq!(formats[0].bits_per_sample, 16);
        assert_eq!(formats[0].n_block_align, 4);
        assert_eq!(formats[0].n_avg_bytes_per_sec, 4 * AudioFormat::internal().sample_rate_hz);
    }
}
