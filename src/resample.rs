//! Consumer-side sample-rate conversion.
//!
//! The capture callback always writes at the server rate. When the host pulls
//! at a different rate, each channel reader interpolates linearly between the
//! two input samples straddling the output position. Phase and the
//! interpolation pair persist across pulls so block boundaries are seamless.

use dasp_frame::{Frame, Mono};

use crate::ring::{HandoffBuffer, PullReport};

/// Lowest sample rate accepted for conversion.
pub const MIN_RATE: u32 = 8_000;
/// Highest sample rate accepted for conversion.
pub const MAX_RATE: u32 = 192_000;

/// Linear interpolating reader over a [`HandoffBuffer`].
pub struct StreamResampler {
    phase: f64,
    current: Mono<f32>,
    next: Mono<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler able to consume up to `max_input_frames` per pull.
    pub fn new(max_input_frames: usize) -> Self {
        Self {
            phase: 1.0,
            current: Mono::EQUILIBRIUM,
            next: Mono::EQUILIBRIUM,
            scratch: vec![0.0; max_input_frames.max(1)],
        }
    }

    /// Forget interpolation history. The next converted pull starts from
    /// silence.
    pub fn reset(&mut self) {
        self.phase = 1.0;
        self.current = Mono::EQUILIBRIUM;
        self.next = Mono::EQUILIBRIUM;
    }

    /// Fractional position between the current interpolation pair.
    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Fill `out` at `target_rate` from `ring`, which holds audio at
    /// `source_rate`. Always fills `out` completely.
    pub fn pull(
        &mut self,
        ring: &HandoffBuffer,
        source_rate: u32,
        target_rate: u32,
        out: &mut [f32],
    ) -> PullReport {
        if out.is_empty() {
            return PullReport::default();
        }
        let source_rate = source_rate.clamp(MIN_RATE, MAX_RATE);
        let target_rate = target_rate.clamp(MIN_RATE, MAX_RATE);
        if source_rate == target_rate {
            self.reset();
            return ring.pull(out);
        }

        let step = source_rate as f64 / target_rate as f64;
        let needed = self.advances_needed(out.len(), step).min(self.scratch.len());
        let got = ring.read_into(&mut self.scratch[..needed]);

        let mut cursor = 0usize;
        let mut produced = 0usize;
        'render: for slot in out.iter_mut() {
            while self.phase >= 1.0 {
                let Some(&sample) = self.scratch[..got].get(cursor) else {
                    break 'render;
                };
                cursor += 1;
                self.phase -= 1.0;
                self.current = self.next;
                self.next = [sample];
            }
            let t = self.phase as f32;
            let frame: Mono<f32> = self.current.zip_map(self.next, |a, b| a + (b - a) * t);
            *slot = frame[0];
            self.phase += step;
            produced += 1;
        }

        let padded = out.len() - produced;
        if padded > 0 {
            out[produced..].fill(0.0);
            ring.note_underrun(padded);
        }
        PullReport {
            read: produced,
            padded,
        }
    }

    fn advances_needed(&self, frames: usize, step: f64) -> usize {
        let mut phase = self.phase;
        let mut needed = 0usize;
        for _ in 0..frames {
            while phase >= 1.0 {
                phase -= 1.0;
                needed += 1;
            }
            phase += step;
        }
        needed
    }
}
