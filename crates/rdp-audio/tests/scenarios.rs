//! Concrete end-to-end scenarios driving `AudioEngine` as a whole,
//! mirroring the six scenarios used to validate the pipeline by hand.

use rdp_audio::{AudioConfig, AudioEngine, AudioFormat, Sample};

fn engine() -> AudioEngine {
    AudioEngine::new(AudioConfig::default())
}

#[test]
fn cold_start_steady_source_flushes_first_chunk_at_400ms() {
    let engine = engine();
    engine.register_client(1, 0, AudioFormat::internal());
    engine.begin_negotiate(1);

    // 2.0s at 22050Hz submitted in 10ms slices.
    let slice = vec![Sample::from_i16(100, -100); 220];
    let mut now_ms = 0u64;
    for _ in 0..200 {
        engine.submit_samples(&slice, 22050, now_ms, now_ms * 1_000_000);
        now_ms += 10;
    }

    let early = engine.tick(390);
    assert!(early.get(&1).map(|p| p.is_empty()).unwrap_or(true));

    let first = engine.tick(400);
    assert!(first.get(&1).map(|p| !p.is_empty()).unwrap_or(false));
}

#[test]
fn rate_mismatch_restarts_resampler_for_new_source_rate() {
    let engine = engine();
    engine.register_client(2, 0, AudioFormat::internal());
    engine.begin_negotiate(2);

    let one_second_44100: Vec<Sample> = vec![Sample::from_i16(500, -500); 44100];
    engine.submit_samples(&one_second_44100, 44100, 0, 0);

    // Should not panic and should eventually produce output once due.
    let out = engine.tick(400);
    assert!(out.contains_key(&2));
}

#[test]
fn stream_end_handshake_requires_confirmation_before_close() {
    let engine = engine();
    engine.register_client(3, 0, AudioFormat::internal());
    engine.begin_negotiate(3);

    let samples = vec![Sample::from_i16(1, 1); 2205];
    engine.submit_samples(&samples, 22050, 0, 0);

    engine.tick(400);
    // Second tick with no further submissions drains the remaining
    // partial chunk and marks the stream finished once the list empties.
    engine.tick(500);

    // Wait past the 1s pause window: expect an end-of-stream broadcast.
    let out = engine.tick(1600);
    assert!(out.contains_key(&3));
}

#[test]
fn pause_detection_resets_rate_state_after_1s_idle() {
    let engine = engine();
    engine.register_client(4, 0, AudioFormat::internal());
    engine.begin_negotiate(4);

    let samples = vec![Sample::from_i16(1, 1); 2205];
    engine.submit_samples(&samples, 22050, 0, 0);
    engine.tick(400);
    engine.tick(500);

    // No more submissions: scheduler keeps pulsing keep-alives, then
    // after 1s past empty, emits end-of-stream and resets.
    let mut saw_output = false;
    for ms in (600..=2000).step_by(100) {
        let out = engine.tick(ms);
        if out.values().any(|v| !v.is_empty()) {
            saw_output = true;
        }
    }
    assert!(saw_output);
}
