//! Audio file loading

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

/// Decoded audio as read from disk, channels interleaved
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Interleaved samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Number of interleaved channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioClip {
    /// Mono clip
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }

    /// Average all channels into one
    pub fn to_mono(&self) -> Result<Vec<f32>> {
        match self.channels {
            0 => anyhow::bail!("Unsupported channel layout: 0 channels"),
            1 => Ok(self.samples.clone()),
            n => {
                if self.samples.len() % n as usize != 0 {
                    anyhow::bail!(
                        "Sample count {} is not a multiple of {} channels",
                        self.samples.len(),
                        n
                    );
                }
                Ok(self
                    .samples
                    .chunks(n as usize)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                    .collect())
            }
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.channels == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.channels as f32 / self.sample_rate as f32
    }
}

/// Audio loader
pub struct AudioLoader;

impl AudioLoader {
    /// Load an audio file without altering rate or channels
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AudioClip> {
        let path = path.as_ref();

        if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("wav")) {
            return Self::load_wav(path);
        }

        Err(anyhow::anyhow!("Unsupported audio format: {:?}", path))
    }

    fn load_wav(path: &Path) -> Result<AudioClip> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {:?}", path))?;

        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .context("Corrupt WAV data")?,
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_value))
                    .collect::<std::result::Result<_, _>>()
                    .context("Corrupt WAV data")?
            }
        };

        debug!(
            "Loaded {:?}: {} samples, {} channels, {} Hz",
            path,
            samples.len(),
            spec.channels,
            spec.sample_rate
        );

        Ok(AudioClip {
            samples,
            channels: spec.channels,
            sample_rate: spec.sample_rate,
        })
    }
}
