//! Byte-scaled spectrum analysis for loudness taps
//!
//! Mirrors the usual analyser-node behaviour: 256-point FFT over a Blackman
//! window, time smoothing of the magnitudes, then decibels mapped linearly
//! from `[-100 dB, -30 dB]` onto `0..=255`.

use crate::device::FrequencyAnalyser;
use parking_lot::Mutex;
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::warn;

/// Analysis window length
pub const FFT_SIZE: usize = 256;
/// Number of bins reported by [`SpectrumTap`]
pub const BIN_COUNT: usize = FFT_SIZE / 2;

const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

struct TapState {
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
}

/// Frequency analyser with its own smoothing state.
///
/// Feed it either by [`SpectrumTap::push`] (input side, the tap keeps the
/// last [`FFT_SIZE`] samples) or by handing a rendered block straight to
/// [`SpectrumTap::analyse`] (output side).
pub struct SpectrumTap {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    state: Mutex<TapState>,
}

impl SpectrumTap {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            state: Mutex::new(TapState {
                history: VecDeque::from(vec![0.0; FFT_SIZE]),
                smoothed: vec![0.0; BIN_COUNT],
            }),
        }
    }

    /// Append freshly captured samples, keeping the most recent window.
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.state.lock();
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        for &s in tail {
            state.history.pop_front();
            state.history.push_back(s);
        }
    }

    /// Analyse one block (zero-padded or truncated to [`FFT_SIZE`]).
    pub fn analyse(&self, block: &[f32]) -> Vec<u8> {
        let mut state = self.state.lock();
        self.analyse_locked(&mut state, block)
    }

    fn analyse_locked(&self, state: &mut TapState, block: &[f32]) -> Vec<u8> {
        let mut input = self.fft.make_input_vec();
        for (i, slot) in input.iter_mut().enumerate() {
            *slot = block.get(i).copied().unwrap_or(0.0) * self.window[i];
        }
        let mut spectrum = self.fft.make_output_vec();
        if let Err(e) = self.fft.process(&mut input, &mut spectrum) {
            warn!("Spectrum analysis failed: {}", e);
            return vec![0; BIN_COUNT];
        }

        let scale = 1.0 / FFT_SIZE as f32;
        let mut bins = Vec::with_capacity(BIN_COUNT);
        for (k, smoothed) in state.smoothed.iter_mut().enumerate() {
            let magnitude = spectrum[k].norm() * scale;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            bins.push(to_byte(*smoothed));
        }
        bins
    }
}

impl Default for SpectrumTap {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyAnalyser for SpectrumTap {
    fn frequency_bins(&self) -> Vec<u8> {
        let mut state = self.state.lock();
        let block: Vec<f32> = state.history.iter().copied().collect();
        self.analyse_locked(&mut state, &block)
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB);
    scaled.clamp(0.0, 255.0) as u8
}
