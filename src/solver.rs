//! Bitrate and resolution for a size-constrained encode.

use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::SolverSettings;
use crate::error::{Error, Result, Warning};
use crate::toolchain::MediaInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Same aspect ratio at `height`, both sides rounded to even.
    fn scaled_to(&self, height: u32) -> Resolution {
        let width = (self.width as f64 * height as f64 / self.height as f64).round() as u32;
        Resolution {
            width: even(width),
            height: even(height),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn even(v: u32) -> u32 {
    (v & !1).max(2)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeSolution {
    /// Video bitrate in bits per second.
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    /// Set only when the output differs from the source resolution.
    pub resolution: Option<Resolution>,
    pub warning: Option<Warning>,
}

impl SizeSolution {
    pub fn predicted_bytes(&self, duration: f64) -> u64 {
        ((self.video_bitrate + self.audio_bitrate) as f64 * duration / 8.0) as u64
    }
}

fn floor_bitrate(resolution: Resolution, settings: &SolverSettings) -> u64 {
    let per_pixel = (resolution.pixels() as f64 * settings.floor_bits_per_pixel) as u64;
    per_pixel.max(settings.floor_min_bitrate)
}

/// Pick a video bitrate, stepping down the resolution ladder while the bitrate
/// the budget affords is below what the resolution needs.
///
/// Never fails on a tiny target: when the ladder runs out the floor bitrate at
/// the lowest tier is used and the solution carries `PartialLadderExhausted`.
pub fn solve(
    path: &Path,
    info: &MediaInfo,
    target_bytes: u64,
    settings: &SolverSettings,
) -> Result<SizeSolution> {
    let duration = info.duration;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(Error::probe_failed(
            path,
            format!("unusable duration {}", duration),
        ));
    }

    let budget_bits = target_bytes as f64 * 8.0 * settings.safety_margin;
    let video_bitrate = (budget_bits - settings.audio_bitrate as f64 * duration) / duration;

    let source = Resolution {
        width: info.width,
        height: info.height,
    };
    let tiers = settings
        .ladder
        .iter()
        .filter(|&&h| h < source.height)
        .map(|&h| source.scaled_to(h));

    let mut candidate = source;
    for next in std::iter::once(source).chain(tiers) {
        candidate = next;
        let floor = floor_bitrate(candidate, settings);
        debug!(
            "{}: {} affords {:.0} bps against a floor of {} bps",
            path.display(),
            candidate,
            video_bitrate,
            floor
        );
        if video_bitrate >= floor as f64 {
            return Ok(SizeSolution {
                video_bitrate: video_bitrate as u64,
                audio_bitrate: settings.audio_bitrate,
                resolution: (candidate != source).then_some(candidate),
                warning: None,
            });
        }
    }

    let mut solution = SizeSolution {
        video_bitrate: floor_bitrate(candidate, settings),
        audio_bitrate: settings.audio_bitrate,
        resolution: (candidate != source).then_some(candidate),
        warning: None,
    };
    let warning = Warning::PartialLadderExhausted {
        target_bytes,
        predicted_bytes: solution.predicted_bytes(duration),
    };
    warn!("{}: {}", path.display(), warning);
    solution.warning = Some(warning);
    Ok(solution)
}
