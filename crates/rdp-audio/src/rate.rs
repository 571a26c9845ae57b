//! Component B: the rate-correction engine.
//!
//! Two independent control loops share one register, `dst_freq_hz`: the
//! source-rate loop retunes it to track the guest's actual sample
//! production rate against wall-clock time, and the client-sync loop
//! nudges `freq_delta` on top of it based on client acknowledgement
//! queue depth.

use crate::types::{duration_ns, RateCorrectionMode, FREQ_DELTA_STEP_HZ, INTERNAL_FREQ_HZ, RATE_CLAMP_HZ, RATE_HISTORY_LEN};

#[derive(Debug)]
pub struct RateCorrection {
    mode: RateCorrectionMode,
    dst_freq_hz: u32,
    rate_started: bool,
    rate_window_start_ns: u64,
    rate_window_samples_ns: u64,
    dst_freq_history: [u32; RATE_HISTORY_LEN],
    history_len: usize,
    history_next: usize,
    freq_delta: i32,
    last_client_queue_depth: u32,
}

impl RateCorrection {
    pub fn new(mode: RateCorrectionMode) -> Self {
        Self {
            mode,
            dst_freq_hz: INTERNAL_FREQ_HZ,
            rate_started: false,
            rate_window_start_ns: 0,
            rate_window_samples_ns: 0,
            dst_freq_history: [0; RATE_HISTORY_LEN],
            history_len: 0,
            history_next: 0,
            freq_delta: 0,
            last_client_queue_depth: 0,
        }
    }

    pub fn dst_freq_hz(&self) -> u32 {
        self.dst_freq_hz
    }

    pub fn low_pass_filter_enabled(&self) -> bool {
        self.mode.has(RateCorrectionMode::LOW_PASS_FILTER)
    }

    /// Rate the resampler should be producing right now: the smoothed
    /// estimate plus whatever the client-sync loop has added.
    pub fn resampler_target_hz(&self) -> u32 {
        (i64::from(self.dst_freq_hz) + i64::from(self.freq_delta))
            .clamp(1, u32::MAX as i64) as u32
    }

    /// Loop 1: called once per VM submission with the duration, in
    /// samples at `src_freq`, that was just appended.
    pub fn observe_submission(&mut self, samples: u64, src_freq: u32, now_ns: u64) {
        if !self.rate_started {
            self.rate_started = true;
            self.rate_window_start_ns = now_ns;
            self.rate_window_samples_ns = 0;
        }

        let dur_ns = duration_ns(samples, src_freq);
        self.rate_window_samples_ns += dur_ns;

        if !self.mode.has(RateCorrectionMode::RATE_CORRECTION) {
            return;
        }

        let elapsed_ns = now_ns.saturating_sub(self.rate_window_start_ns);
        if elapsed_ns < 2_000_000_000 || self.rate_window_samples_ns == 0 {
            return;
        }

        let estimate = (u64::from(INTERNAL_FREQ_HZ) * elapsed_ns / self.rate_window_samples_ns) as i64;
        let clamped = estimate.clamp(
            i64::from(INTERNAL_FREQ_HZ) - RATE_CLAMP_HZ,
            i64::from(INTERNAL_FREQ_HZ) + RATE_CLAMP_HZ,
        ) as u32;

        self.dst_freq_history[self.history_next] = clamped;
        self.history_next = (self.history_next + 1) % RATE_HISTORY_LEN;
        self.history_len = (self.history_len + 1).min(RATE_HISTORY_LEN);

        if self.history_len == RATE_HISTORY_LEN {
            let sum: u64 = self.dst_freq_history.iter().map(|&v| u64::from(v)).sum();
            self.dst_freq_hz = (sum / RATE_HISTORY_LEN as u64) as u32;
        }

        self.rate_window_start_ns = now_ns;
        self.rate_window_samples_ns = dur_ns;
    }

    /// Loop 2: called from the acknowledgement path with the latest
    /// averaged client queue depth, in packets.
    ///
    /// The thresholds compare against the *previous* depth, not a fixed
    /// hysteresis band: a jump like 2 -> 6 satisfies neither branch.
    /// This matches the original implementation and is preserved as-is.
    pub fn on_client_queue_depth(&mut self, depth: u32) {
        if !self.mode.has(RateCorrectionMode::CLIENT_SYNC) {
            self.last_client_queue_depth = depth;
            return;
        }

        if self.last_client_queue_depth != 0 {
            if depth < 3 && depth > self.last_client_queue_depth {
                self.freq_delta += FREQ_DELTA_STEP_HZ;
            } else if depth > 5 && depth < self.last_client_queue_depth {
                self.freq_delta -= FREQ_DELTA_STEP_HZ;
            }
        }

        self.last_client_queue_depth = depth;
    }

    pub fn freq_delta(&self) -> i32 {
        self.freq_delta
    }

    /// Reset all adaptive state after a stream ends, per the scheduler's
    /// pause-detection path. `dst_freq_hz` only resets if rate correction
    /// is enabled; `freq_delta` and the queue-depth memory always reset.
    pub fn reset_after_stream_end(&mut self) {
        if self.mode.has(RateCorrectionMode::RATE_CORRECTION) {
            self.dst_freq_hz = INTERNAL_FREQ_HZ;
            self.rate_started = false;
            self.rate_window_start_ns = 0;
            self.rate_window_samples_ns = 0;
            self.dst_freq_history = [0; RATE_HISTORY_LEN];
            self.history_len = 0;
            self.history_next = 0;
        }
        self.freq_delta = 0;
        self.last_client_queue_depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_freq_stays_within_clamp() {
        let mut rc = RateCorrection::new(RateCorrectionMode::default());
        // Guest runs fast: twice the samples in the same wall time.
        rc.observe_submission(2 * u64::from(INTERNAL_FREQ_HZ), INTERNAL_FREQ_HZ, 2_000_000_000);
        assert!((i64::from(rc.dst_freq_hz()) - i64::from(INTERNAL_FREQ_HZ)).abs() <= RATE_CLAMP_HZ);
    }

    #[test]
    fn converges_to_internal_rate_under_matched_clock() {
        let mut rc = RateCorrection::new(RateCorrectionMode::default());
        let mut now_ns = 0u64;
        for _ in 0..RATE_HISTORY_LEN {
            now_ns += 2_000_000_000;
            rc.observe_submission(2 * u64::from(INTERNAL_FREQ_HZ), INTERNAL_FREQ_HZ, now_ns);
        }
        assert!((i64::from(rc.dst_freq_hz()) - i64::from(INTERNAL_FREQ_HZ)).abs() <= 1);
    }

    #[test]
    fn client_sync_speeds_up_on_low_increasing_depth() {
        let mut rc = RateCorrection::new(RateCorrectionMode(RateCorrectionMode::CLIENT_SYNC));
        rc.on_client_queue_depth(1);
        rc.on_client_queue_depth(2);
        assert_eq!(rc.freq_delta(), FREQ_DELTA_STEP_HZ);
    }

    #[test]
    fn client_sync_slows_down_on_high_decreasing_depth() {
        let mut rc = RateCorrection::new(RateCorrectionMode(RateCorrectionMode::CLIENT_SYNC));
        rc.on_client_queue_depth(8);
        rc.on_client_queue_depth(6);
        assert_eq!(rc.freq_delta(), -FREQ_DELTA_STEP_HZ);
    }

    #[test]
    fn client_sync_open_question_jump_fires_neither_branch() {
        let mut rc = RateCorrection::new(RateCorrectionMode(RateCorrectionMode::CLIENT_SYNC));
        rc.on_client_queue_depth(2);
        rc.on_client_queue_depth(6);
        assert_eq!(rc.freq_delta(), 0);
    }

    #[test]
    fn reset_clears_delta_and_history() {
        let mut rc = RateCorrection::new(RateCorrectionMode::default());
        rc.on_client_queue_depth(1);
        rc.reset_after_stream_end();
        assert_eq!(rc.freq_delta(), 0);
        assert_eq!(rc.dst_freq_hz(), INTERNAL_FREQ_HZ);
    }
}
