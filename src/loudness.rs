//! Loudness monitor
//!
//! Polls the playback and capture analysis taps once per display tick and
//! reduces each to a single intensity scalar for the UI.

use crate::device::FrequencyAnalyser;
use crate::events::Loudness;
use std::sync::Arc;

/// Normalised level of one set of frequency bins: `min(1, mean / divisor)`.
pub fn level(bins: &[u8], divisor: f32) -> f32 {
    if bins.is_empty() || divisor <= 0.0 {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| b as u32).sum();
    let mean = sum as f32 / bins.len() as f32;
    (mean / divisor).min(1.0)
}

pub struct LoudnessMonitor {
    output: Arc<dyn FrequencyAnalyser>,
    input: Arc<dyn FrequencyAnalyser>,
    divisor: f32,
}

impl LoudnessMonitor {
    pub fn new(
        output: Arc<dyn FrequencyAnalyser>,
        input: Arc<dyn FrequencyAnalyser>,
        divisor: f32,
    ) -> Self {
        Self {
            output,
            input,
            divisor,
        }
    }

    /// Read both taps. Disconnected reads as silence on both sides; muted
    /// skips the capture tap entirely.
    pub fn sample(&self, connected: bool, muted: bool) -> Loudness {
        if !connected {
            return Loudness::default();
        }

        let ai = level(&self.output.frequency_bins(), self.divisor);
        let user = if muted {
            0.0
        } else {
            level(&self.input.frequency_bins(), self.divisor)
        };

        Loudness { ai, user }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBins {
        bins: Vec<u8>,
        reads: AtomicUsize,
    }

    impl FixedBins {
        fn new(bins: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                bins,
                reads: AtomicUsize::new(0),
            })
        }
    }

    impl FrequencyAnalyser for FixedBins {
        fn frequency_bins(&self) -> Vec<u8> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.bins.clone()
        }
    }

    #[test]
    fn test_level_normalisation() {
        assert_eq!(level(&[], 60.0), 0.0);
        assert_eq!(level(&[30, 30], 60.0), 0.5);
        assert_eq!(level(&[255; 8], 60.0), 1.0);
    }

    #[test]
    fn test_sample_respects_connection_and_mute() {
        let out = FixedBins::new(vec![60; 4]);
        let inp = FixedBins::new(vec![15; 4]);
        let monitor = LoudnessMonitor::new(out.clone(), inp.clone(), 60.0);

        assert_eq!(monitor.sample(false, false), Loudness::default());
        assert_eq!(out.reads.load(Ordering::SeqCst), 0);

        assert_eq!(monitor.sample(true, false), Loudness { ai: 1.0, user: 0.25 });

        let muted = monitor.sample(true, true);
        assert_eq!(muted.user, 0.0);
        assert_eq!(inp.reads.load(Ordering::SeqCst), 1);
    }
}
