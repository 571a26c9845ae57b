//! The resampler black box.
//!
//! Section 1 of the spec treats the rate-conversion kernel as an external
//! collaborator exposing `start`/`update`/`convert`/`stop`. [`Resampler`]
//! pins that contract down as a trait so the rest of the engine never
//! depends on a concrete implementation, and [`RubatoResampler`] supplies
//! a real stereo adapter over `rubato`'s sinc interpolator.

use rubato::{Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::ResamplerError;
use crate::types::Sample;

/// Rate-conversion kernel, black-box per the spec.
pub trait Resampler: Send {
    fn start(&mut self, src_hz: u32, dst_hz: u32, low_pass_filter: bool) -> Result<(), ResamplerError>;
    fn update(&mut self, src_hz: u32, dst_hz: u32) -> Result<(), ResamplerError>;
    fn convert(&mut self, input: &[Sample]) -> Result<Vec<Sample>, ResamplerError>;
    fn stop(&mut self);
}

/// Chunk size rubato's `SincFixedIn` processes at a time. Small enough to
/// keep latency reasonable against the 200ms chunk cadence.
const RUBATO_CHUNK: usize = 1024;

pub struct RubatoResampler {
    inner: Option<SincFixedIn<f32>>,
    src_hz: u32,
    dst_hz: u32,
    low_pass_filter: bool,
    input_left: Vec<f32>,
    input_right: Vec<f32>,
}

impl RubatoResampler {
    pub fn new() -> Self {
        Self {
            inner: None,
            src_hz: 0,
            dst_hz: 0,
            low_pass_filter: true,
            input_left: Vec::new(),
            input_right: Vec::new(),
        }
    }

    fn build(src_hz: u32, dst_hz: u32, low_pass_filter: bool) -> Result<SincFixedIn<f32>, ResamplerError> {
        let params = if low_pass_filter {
            SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            }
        } else {
            SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.99,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 64,
                window: WindowFunction::Blackman,
            }
        };

        SincFixedIn::<f32>::new(f64::from(dst_hz) / f64::from(src_hz), 2.0, params, RUBATO_CHUNK, 2).map_err(
            |source| ResamplerError::Construct { src_hz, dst_hz, source },
        )
    }
}

impl Default for RubatoResampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler for RubatoResampler {
    fn start(&mut self, src_hz: u32, dst_hz: u32, low_pass_filter: bool) -> Result<(), ResamplerError> {
        self.inner = Some(Self::build(src_hz, dst_hz, low_pass_filter)?);
        self.src_hz = src_hz;
        self.dst_hz = dst_hz;
        self.low_pass_filter = low_pass_filter;
        self.input_left.clear();
        self.input_right.clear();
        Ok(())
    }

    fn update(&mut self, src_hz: u32, dst_hz: u32) -> Result<(), ResamplerError> {
        if src_hz == self.src_hz && dst_hz == self.dst_hz {
            return Ok(());
        }
        self.inner = Some(Self::build(src_hz, dst_hz, self.low_pass_filter)?);
        self.src_hz = src_hz;
        self.dst_hz = dst_hz;
        Ok(())
    }

    fn convert(&mut self, input: &[Sample]) -> Result<Vec<Sample>, ResamplerError> {
        if self.src_hz == self.dst_hz {
            return Ok(input.to_vec());
        }

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        for s in input {
            self.input_left.push(s.left as f32 / i32::from(i16::MAX).max(1) as f32);
            self.input_right.push(s.right as f32 / i32::from(i16::MAX).max(1) as f32);
        }

        let mut out = Vec::new();
        while self.input_left.len() >= RUBATO_CHUNK {
            let left: Vec<f32> = self.input_left.drain(..RUBATO_CHUNK).collect();
            let right: Vec<f32> = self.input_right.drain(..RUBATO_CHUNK).collect();
            let frames = resampler
                .process(&[left, right], None)
                .map_err(|source| ResamplerError::Process { source })?;
            if frames.len() == 2 {
                for (l, r) in frames[0].iter().zip(frames[1].iter()) {
                    out.push(Sample {
                        left: (l.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i32,
                        right: (r.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i32,
                    });
                }
            }
        }

        Ok(out)
    }

    fn stop(&mut self) {
        self.inner = None;
        self.input_left.clear();
        self.input_right.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_equal() {
        let mut r = RubatoResampler::new();
        r.start(22050, 22050, true).unwrap();
        let input = vec![Sample::from_i16(100, -100); 50];
        let out = r.convert(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn downsamples_and_produces_output_eventually() {
        let mut r = RubatoResampler::new();
        r.start(44100, 22050, true).unwrap();
        let input: Vec<Sample> = (0..4096)
            .map(|i| Sample::from_i16(((i % 100) as i16) - 50, ((i % 100) as i16) - 50))
            .collect();
        let out = r.convert(&input).unwrap();
        assert!(!out.is_empty());
        assert!(out.len() < input.len());
    }

    #[test]
    fn stop_clears_state() {
        let mut r = RubatoResampler::new();
        r.start(44100, 22050, true).unwrap();
        r.convert(&vec![Sample::ZERO; 10]).unwrap();
        r.stop();
        assert!(r.inner.is_none());
    }
}
