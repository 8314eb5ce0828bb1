use std::path::PathBuf;

use crate::error::{Error, Result};

/// Extensions (lowercase, no dot) the discoverer accepts.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "flv", "wmv", "webm"];

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CRF: u32 = 30;
pub const DEFAULT_PRESET: &str = "slow";

/// Tunables for a batch run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of encodes running at the same time.
    pub workers: usize,
    /// Constant Rate Factor for quality mode (0-51, lower is better quality).
    pub crf: u32,
    /// x264 preset used in both modes.
    pub preset: String,
    /// Audio bitrate in quality mode, bits per second.
    pub quality_audio_bitrate: u64,
    pub solver: SolverSettings,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// `-threads` handed to each encoder process.
    pub encoder_threads: usize,
}

/// Constants driving the size-target solver.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Audio bitrate reserved in size-target mode, bits per second.
    pub audio_bitrate: u64,
    /// Fraction of the target actually budgeted; the rest absorbs container overhead.
    pub safety_margin: f64,
    /// Minimum acceptable video bits per pixel per second.
    pub floor_bits_per_pixel: f64,
    /// Minimum acceptable video bitrate at any resolution.
    pub floor_min_bitrate: u64,
    /// Descending frame heights tried when the bitrate is below the floor.
    pub ladder: Vec<u32>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            audio_bitrate: 64_000,
            safety_margin: 0.95,
            floor_bits_per_pixel: 0.1,
            floor_min_bitrate: 32_000,
            ladder: vec![1080, 720, 480, 360, 240],
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_workers(DEFAULT_WORKERS)
    }
}

impl Settings {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            crf: DEFAULT_CRF,
            preset: DEFAULT_PRESET.to_string(),
            quality_audio_bitrate: 128_000,
            solver: SolverSettings::default(),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            encoder_threads: threads_per_encoder(workers),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(Error::InvalidArgument("worker count must be at least 1".into()));
        }
        if self.crf > 51 {
            return Err(Error::InvalidArgument("CRF must be between 0 and 51".into()));
        }
        if self.preset.trim().is_empty() {
            return Err(Error::InvalidArgument("preset must not be empty".into()));
        }
        let margin = self.solver.safety_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "safety margin must be in (0, 1], got {}",
                margin
            )));
        }
        let ladder = &self.solver.ladder;
        if ladder.is_empty() || ladder.windows(2).any(|w| w[0] <= w[1]) || ladder.contains(&0) {
            return Err(Error::InvalidArgument(
                "resolution ladder must be non-empty and strictly descending".into(),
            ));
        }
        Ok(())
    }
}

/// Split the machine's cores between the parallel encodes.
fn threads_per_encoder(workers: usize) -> usize {
    (num_cpus::get() / workers.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.crf, 30);
        assert!(settings.encoder_threads >= 1);
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut settings = Settings::default();
        settings.workers = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.crf = 60;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.solver.safety_margin = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.solver.ladder = vec![480, 720];
        assert!(settings.validate().is_err());
    }
}
