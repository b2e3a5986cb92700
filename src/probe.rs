//! Test-tone generation and signal comparison used by the simulated server
//! and self-tests.

use dasp_signal::Signal;

/// Deterministic sine generator.
pub struct ToneGenerator {
    signal: dasp_signal::Sine<dasp_signal::ConstHz>,
    amplitude: f32,
}

impl ToneGenerator {
    /// A sine of `frequency_hz` at `sample_rate` scaled by `amplitude`.
    pub fn new(sample_rate: u32, frequency_hz: f64, amplitude: f32) -> Self {
        Self {
            signal: dasp_signal::rate(sample_rate as f64)
                .const_hz(frequency_hz)
                .sine(),
            amplitude,
        }
    }

    /// Render the next `out.len()` samples.
    pub fn fill(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.signal.next() as f32 * self.amplitude;
        }
    }
}

/// Render `frames` samples of a sine wave.
pub fn sine(sample_rate: u32, frequency_hz: f64, amplitude: f32, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames];
    ToneGenerator::new(sample_rate, frequency_hz, amplitude).fill(&mut out);
    out
}

/// Root-mean-square level of `signal`.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let energy: f32 = signal.iter().map(|s| s * s).sum();
    (energy / signal.len() as f32).sqrt()
}

/// Normalised correlation of two equally long signals (-1..1).
pub fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        energy_a += (*x as f64).powi(2);
        energy_b += (*y as f64).powi(2);
    }
    if energy_a == 0.0 || energy_b == 0.0 {
        0.0
    } else {
        (dot / (energy_a.sqrt() * energy_b.sqrt())) as f32
    }
}

/// Best-matching lag of `recorded` against `reference`, searching lags
/// `0..=max_lag`. Returns `(lag, correlation)`.
pub fn best_lag(reference: &[f32], recorded: &[f32], max_lag: usize) -> (usize, f32) {
    let mut best = (0usize, f32::MIN);
    for lag in 0..=max_lag {
        if lag >= recorded.len() {
            break;
        }
        let len = reference.len().min(recorded.len() - lag);
        let corr = correlation(&reference[..len], &recorded[lag..lag + len]);
        if corr > best.1 {
            best = (lag, corr);
        }
    }
    best
}
