//! Whisper log-mel spectrogram
//!
//! Audio is padded or trimmed to `num_frames * hop_length` samples, framed
//! with a centered (reflect-padded) periodic Hann window, and projected on a
//! Slaney-scale filterbank. The log power is clamped to 8 decades below its
//! maximum and rescaled with `(x + 4) / 4`.

use anyhow::{Context, Result};
use candle_core::{safetensors, Device};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::path::Path;

/// Log-mel spectrogram computer
pub struct MelSpectrogram {
    /// FFT size (also the window length)
    pub n_fft: usize,
    /// Hop length
    pub hop_length: usize,
    /// Number of mel bands
    pub n_mels: usize,
    /// Sample rate
    pub sample_rate: u32,
    /// Output frames; the input is padded or trimmed to match
    pub num_frames: usize,
    /// Mel filterbank, `n_mels` rows of `n_fft / 2 + 1` weights
    mel_filters: Vec<Vec<f32>>,
    /// Periodic Hann window
    window: Vec<f32>,
}

impl MelSpectrogram {
    /// Create a spectrogram computer with a Slaney filterbank over `0..sr/2`
    pub fn new(
        n_fft: usize,
        hop_length: usize,
        n_mels: usize,
        sample_rate: u32,
        num_frames: usize,
    ) -> Self {
        let mel_filters = Self::mel_filterbank(n_fft, n_mels, sample_rate, 0.0, sample_rate as f32 / 2.0);
        Self::with_filters(n_fft, hop_length, sample_rate, num_frames, mel_filters)
    }

    /// Create a spectrogram computer with an explicit filterbank
    pub fn with_filters(
        n_fft: usize,
        hop_length: usize,
        sample_rate: u32,
        num_frames: usize,
        mel_filters: Vec<Vec<f32>>,
    ) -> Self {
        Self {
            n_fft,
            hop_length,
            n_mels: mel_filters.len(),
            sample_rate,
            num_frames,
            mel_filters,
            window: Self::hann_window(n_fft),
        }
    }

    /// Load a precomputed filterbank stored as tensor `mel_<n_mels>` in a
    /// safetensors file
    pub fn load_filters<P: AsRef<Path>>(path: P, n_mels: usize, n_fft: usize) -> Result<Vec<Vec<f32>>> {
        let path = path.as_ref();
        let tensors = safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to load mel filters from {:?}", path))?;
        let name = format!("mel_{}", n_mels);
        let filters = tensors
            .get(&name)
            .with_context(|| format!("Tensor {} not found in {:?}", name, path))?;

        let n_freqs = n_fft / 2 + 1;
        if filters.dims() != [n_mels, n_freqs] {
            anyhow::bail!(
                "Mel filters {} have shape {:?}, expected [{}, {}]",
                name,
                filters.dims(),
                n_mels,
                n_freqs
            );
        }
        Ok(filters.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
    }

    /// Compute the normalized log-mel spectrogram, `n_mels` rows of
    /// `num_frames` values
    pub fn compute(&self, audio: &[f32]) -> Result<Vec<Vec<f32>>> {
        if self.hop_length == 0 || self.n_fft == 0 {
            anyhow::bail!("n_fft and hop_length must be greater than 0");
        }
        let padded = self.pad_or_trim(audio);
        let power = self.power_frames(&padded);
        let mel = self.apply_mel_filters(&power);
        Ok(self.log_normalize(mel))
    }

    fn pad_or_trim(&self, audio: &[f32]) -> Vec<f32> {
        let n_samples = self.num_frames * self.hop_length;
        let mut out = audio[..audio.len().min(n_samples)].to_vec();
        out.resize(n_samples, 0.0);
        out
    }

    /// Power spectrum of each centered frame; the trailing frame is dropped
    fn power_frames(&self, audio: &[f32]) -> Vec<Vec<f32>> {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(self.n_fft);
        let half = self.n_fft / 2;
        let n_freqs = half + 1;

        let mut frames = Vec::with_capacity(self.num_frames);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        for i in 0..self.num_frames {
            let center = (i * self.hop_length) as isize;
            for (j, slot) in buffer.iter_mut().enumerate() {
                let idx = reflect(center + j as isize - half as isize, audio.len());
                *slot = Complex::new(audio[idx] * self.window[j], 0.0);
            }
            fft.process(&mut buffer);
            frames.push(buffer[..n_freqs].iter().map(|c| c.norm_sqr()).collect());
        }
        frames
    }

    /// Project frames on the filterbank, producing `n_mels × num_frames`
    fn apply_mel_filters(&self, power: &[Vec<f32>]) -> Vec<Vec<f32>> {
        self.mel_filters
            .iter()
            .map(|filter| {
                power
                    .iter()
                    .map(|frame| filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }

    fn log_normalize(&self, mel: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
        let mut mel = mel;
        let mut max = f32::NEG_INFINITY;
        for v in mel.iter_mut().flatten() {
            *v = v.max(1e-10).log10();
            max = max.max(*v);
        }
        let floor = max - 8.0;
        for v in mel.iter_mut().flatten() {
            *v = (v.max(floor) + 4.0) / 4.0;
        }
        mel
    }

    /// Periodic Hann window
    fn hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
            .collect()
    }

    /// Hz to mel, Slaney scale
    fn hz_to_mel(hz: f32) -> f32 {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = 6.4f32.ln() / 27.0;
        if hz >= min_log_hz {
            min_log_mel + (hz / min_log_hz).ln() / logstep
        } else {
            hz / f_sp
        }
    }

    /// Mel to Hz, Slaney scale
    fn mel_to_hz(mel: f32) -> f32 {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = 6.4f32.ln() / 27.0;
        if mel >= min_log_mel {
            min_log_hz * (logstep * (mel - min_log_mel)).exp()
        } else {
            f_sp * mel
        }
    }

    /// Slaney-normalized triangular filterbank
    fn mel_filterbank(n_fft: usize, n_mels: usize, sr: u32, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
        let n_freqs = n_fft / 2 + 1;
        let fft_freqs: Vec<f32> = (0..n_freqs)
            .map(|i| i as f32 * sr as f32 / n_fft as f32)
            .collect();

        let mel_min = Self::hz_to_mel(fmin);
        let mel_max = Self::hz_to_mel(fmax);
        let mel_points: Vec<f32> = (0..n_mels + 2)
            .map(|i| Self::mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
            .collect();

        let mut filters = vec![vec![0.0; n_freqs]; n_mels];
        for (i, filter) in filters.iter_mut().enumerate() {
            let left = mel_points[i];
            let center = mel_points[i + 1];
            let right = mel_points[i + 2];
            let enorm = 2.0 / (right - left);

            for (weight, &freq) in filter.iter_mut().zip(fft_freqs.iter()) {
                let lower = (freq - left) / (center - left);
                let upper = (right - freq) / (right - center);
                *weight = lower.min(upper).max(0.0) * enorm;
            }
        }

        filters
    }
}

/// Reflect an out-of-range index back into `0..len` (numpy "reflect" mode)
fn reflect(idx: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = idx;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whisper_mel() -> MelSpectrogram {
        MelSpectrogram::new(400, 160, 80, 16000, 3000)
    }

    #[test]
    fn test_output_shape() {
        let mel = whisper_mel();
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let spec = mel.compute(&samples).unwrap();
        assert_eq!(spec.len(), 80);
        assert!(spec.iter().all(|row| row.len() == 3000));
    }

    #[test]
    fn test_dynamic_range_is_clamped() {
        let mel = MelSpectrogram::new(400, 160, 80, 16000, 200);
        let samples: Vec<f32> = (0..32000)
            .map(|i| 0.3 * (2.0 * PI * 1000.0 * i as f32 / 16000.0).sin())
            .collect();
        let spec = mel.compute(&samples).unwrap();
        let values: Vec<f32> = spec.into_iter().flatten().collect();
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!(max - min <= 2.0 + 1e-5);
    }

    #[test]
    fn test_silence_is_constant() {
        let mel = MelSpectrogram::new(400, 160, 80, 16000, 100);
        let spec = mel.compute(&[]).unwrap();
        for v in spec.into_iter().flatten() {
            assert!((v - (-1.5)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_filterbank_covers_every_band() {
        let filters = MelSpectrogram::mel_filterbank(400, 80, 16000, 0.0, 8000.0);
        assert_eq!(filters.len(), 80);
        for row in &filters {
            assert_eq!(row.len(), 201);
            assert!(row.iter().all(|&w| w >= 0.0));
            assert!(row.iter().any(|&w| w > 0.0));
        }
    }

    #[test]
    fn test_mel_scale_roundtrip() {
        for hz in [0.0f32, 440.0, 1000.0, 4000.0, 8000.0] {
            let back = MelSpectrogram::mel_to_hz(MelSpectrogram::hz_to_mel(hz));
            assert!((back - hz).abs() < 1e-2 * hz.max(1.0));
        }
    }

    #[test]
    fn test_reflect() {
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-1, 1), 0);
    }
}
