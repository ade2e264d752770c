//! Encoder input features

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::{AudioClip, MelSpectrogram, Resampler};
use crate::config::ModelConfig;

/// Turns raw audio into the `(1, n_mels, num_frames)` encoder input
pub struct FeatureExtractor {
    mel: MelSpectrogram,
    dtype: DType,
    device: Device,
}

impl FeatureExtractor {
    /// Build from an explicit spectrogram computer
    pub fn new(mel: MelSpectrogram, dtype: DType, device: &Device) -> Self {
        Self {
            mel,
            dtype,
            device: device.clone(),
        }
    }

    /// Build from the model and audio sections of a config
    pub fn from_config(config: &ModelConfig, device: &Device) -> Result<Self> {
        let audio = &config.audio;
        let model = &config.model;
        let mel = match audio.mel_filters {
            Some(ref path) => {
                let filters = MelSpectrogram::load_filters(path, model.num_mel_bins, audio.n_fft)?;
                MelSpectrogram::with_filters(
                    audio.n_fft,
                    audio.hop_length,
                    audio.sample_rate,
                    model.num_frames,
                    filters,
                )
            }
            None => MelSpectrogram::new(
                audio.n_fft,
                audio.hop_length,
                model.num_mel_bins,
                audio.sample_rate,
                model.num_frames,
            ),
        };
        Ok(Self::new(mel, config.dtype()?, device))
    }

    /// Sample rate the spectrogram expects
    pub fn sample_rate(&self) -> u32 {
        self.mel.sample_rate
    }

    /// Downmix, resample and compute the log-mel features of a clip
    pub fn extract_clip(&self, clip: &AudioClip) -> Result<Tensor> {
        let mono = clip.to_mono()?;
        self.extract(&mono, clip.sample_rate)
    }

    /// Resample mono audio to the model rate and compute log-mel features
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Tensor> {
        let samples = if sample_rate != self.mel.sample_rate {
            debug!("Resampling {} Hz -> {} Hz", sample_rate, self.mel.sample_rate);
            Resampler::resample(samples, sample_rate, self.mel.sample_rate)?
        } else {
            samples.to_vec()
        };

        let spec = self.mel.compute(&samples)?;
        let n_mels = spec.len();
        let n_frames = spec.first().map_or(0, |row| row.len());
        let flat: Vec<f32> = spec.into_iter().flatten().collect();

        let features = Tensor::from_vec(flat, (1, n_mels, n_frames), &self.device)?
            .to_dtype(self.dtype)?;
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_shape_and_dtype() {
        let mel = MelSpectrogram::new(400, 160, 80, 16000, 300);
        let extractor = FeatureExtractor::new(mel, DType::F32, &Device::Cpu);
        let samples: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.05).sin()).collect();
        let features = extractor.extract(&samples, 16000).unwrap();
        assert_eq!(features.dims(), &[1, 80, 300]);
        assert_eq!(features.dtype(), DType::F32);
    }

    #[test]
    fn test_extract_clip_downmixes_and_resamples() {
        let mel = MelSpectrogram::new(400, 160, 80, 16000, 100);
        let extractor = FeatureExtractor::new(mel, DType::F16, &Device::Cpu);
        let clip = AudioClip {
            samples: vec![0.25; 2 * 32000],
            channels: 2,
            sample_rate: 32000,
        };
        let features = extractor.extract_clip(&clip).unwrap();
        assert_eq!(features.dims(), &[1, 80, 100]);
        assert_eq!(features.dtype(), DType::F16);
    }

    #[test]
    fn test_from_default_config() {
        let config = ModelConfig::default();
        let extractor = FeatureExtractor::from_config(&config, &Device::Cpu).unwrap();
        assert_eq!(extractor.sample_rate(), 16000);
    }
}
