//! Audio spectrum analysis
//!
//! Keeps the most recent mono samples of the playing source and turns them
//! into a magnitude spectrum in dB on demand. The window is a Hann window
//! and only the positive-frequency half of the FFT is reported.

use crate::{Error, Result};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

/// FFT length used by players
pub const DEFAULT_FFT_SIZE: usize = 512;

/// Floor of reported magnitudes (dB)
pub const MIN_DB: f32 = -300.0;

/// Rolling FFT over the latest samples
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    history: VecDeque<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Result<Self> {
        if fft_size < 2 {
            return Err(Error::InvalidArgument("fft size must be at least 2".into()));
        }

        // Hann window
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        let mut planner = FftPlanner::new();
        Ok(Self {
            fft: planner.plan_fft_forward(fft_size),
            fft_size,
            window,
            history: VecDeque::with_capacity(fft_size),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of magnitudes per spectrum
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append mono samples, keeping only the last `fft_size`
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &s in &samples[skip..] {
            if self.history.len() == self.fft_size {
                self.history.pop_front();
            }
            self.history.push_back(s);
        }
    }

    /// Drop buffered samples, e.g. after a seek
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Magnitude spectrum of the buffered samples in dB, zero-padded if short
    pub fn analyze(&self) -> Vec<f32> {
        let pad = self.fft_size - self.history.len();
        let mut buffer: Vec<Complex<f32>> = std::iter::repeat(0.0)
            .take(pad)
            .chain(self.history.iter().copied())
            .zip(self.window.iter())
            .map(|(s, &w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        buffer[..self.bin_count()]
            .iter()
            .map(|c| {
                let magnitude = c.norm() * 2.0 / self.fft_size as f32;
                to_db(magnitude)
            })
            .collect()
    }
}

fn to_db(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return MIN_DB;
    }
    (20.0 * magnitude.log10()).clamp(MIN_DB, 0.0)
}
