//! Turning encoder status lines into fractional progress, per job and overall.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::job::JobId;

/// Share of a two-pass job's progress given to the analysis pass.
pub const ANALYSIS_WEIGHT: f64 = 0.2;

/// A point-in-time observation of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job: JobId,
    /// Completion in [0.0, 1.0].
    pub fraction: f64,
    pub eta: Option<Duration>,
}

/// Mean completion over every job of the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateProgress {
    pub fraction: f64,
    pub jobs: usize,
}

fn out_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^out_time=(-?)(\d+):(\d{2}):(\d{2}(?:\.\d+)?)\s*$").expect("valid regex")
    })
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^speed=\s*(\d+(?:\.\d+)?)x\s*$").expect("valid regex"))
}

/// Incremental parser for `-progress pipe:1` output of a single process.
///
/// Unparseable lines are ignored. The fraction never decreases.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_seconds: f64,
    position: f64,
    fraction: f64,
    speed: Option<f64>,
    ended: bool,
}

impl ProgressParser {
    pub fn new(total_seconds: f64) -> Self {
        Self {
            total_seconds,
            position: 0.0,
            fraction: 0.0,
            speed: None,
            ended: false,
        }
    }

    /// Feed one status line; returns the new fraction when it advanced.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if line == "progress=end" {
            self.ended = true;
            return None;
        }
        if let Some(caps) = speed_re().captures(line) {
            self.speed = caps[1].parse().ok().filter(|s: &f64| *s > 0.0);
            return None;
        }

        let seconds = parse_out_time(line)?;
        if seconds <= self.position {
            return None;
        }
        self.position = seconds;
        if !(self.total_seconds > 0.0) {
            return None;
        }
        let fraction = (seconds / self.total_seconds).min(1.0);
        if fraction > self.fraction {
            self.fraction = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Whether the encoder announced `progress=end`.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Remaining media time divided by the encoder's reported speed.
    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed?;
        if !(self.total_seconds > 0.0) {
            return None;
        }
        let remaining = (self.total_seconds - self.position).max(0.0);
        Duration::try_from_secs_f64(remaining / speed).ok()
    }

    /// The process exited successfully: jump to exactly 1.0.
    pub fn finish(&mut self) -> f64 {
        self.fraction = 1.0;
        self.fraction
    }
}

/// Media position in seconds from an `out_time*` line.
fn parse_out_time(line: &str) -> Option<f64> {
    let (key, value) = line.split_once('=')?;
    match key {
        // ffmpeg reports microseconds under both names.
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| us as f64 / 1_000_000.0),
        "out_time" => {
            let caps = out_time_re().captures(line)?;
            if !caps[1].is_empty() {
                return None;
            }
            let hours: f64 = caps[2].parse().ok()?;
            let minutes: f64 = caps[3].parse().ok()?;
            let seconds: f64 = caps[4].parse().ok()?;
            Some(hours * 3600.0 + minutes * 60.0 + seconds)
        }
        _ => None,
    }
}

/// The slice of a job's [0, 1] range covered by one pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassSpan {
    pub start: f64,
    pub width: f64,
}

impl PassSpan {
    pub const WHOLE: PassSpan = PassSpan {
        start: 0.0,
        width: 1.0,
    };
    pub const ANALYSIS: PassSpan = PassSpan {
        start: 0.0,
        width: ANALYSIS_WEIGHT,
    };
    pub const ENCODE: PassSpan = PassSpan {
        start: ANALYSIS_WEIGHT,
        width: 1.0 - ANALYSIS_WEIGHT,
    };

    pub fn map(&self, pass_fraction: f64) -> f64 {
        (self.start + self.width * pass_fraction.clamp(0.0, 1.0)).min(1.0)
    }
}

/// Live per-job fractions of a run. Each job writes only its own slot.
#[derive(Debug)]
pub struct ProgressBoard {
    fractions: Mutex<Vec<f64>>,
}

impl ProgressBoard {
    pub fn new(jobs: usize) -> Self {
        Self {
            fractions: Mutex::new(vec![0.0; jobs]),
        }
    }

    /// Raise a job's fraction (never lowers it) and return the new aggregate.
    pub fn update(&self, job: JobId, fraction: f64) -> AggregateProgress {
        let mut fractions = self.fractions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = fractions.get_mut(job.index()) {
            *slot = slot.max(fraction.clamp(0.0, 1.0));
        }
        aggregate(&fractions)
    }

    pub fn get(&self, job: JobId) -> f64 {
        let fractions = self.fractions.lock().unwrap_or_else(|e| e.into_inner());
        fractions.get(job.index()).copied().unwrap_or(0.0)
    }

    pub fn aggregate(&self) -> AggregateProgress {
        let fractions = self.fractions.lock().unwrap_or_else(|e| e.into_inner());
        aggregate(&fractions)
    }
}

fn aggregate(fractions: &[f64]) -> AggregateProgress {
    let jobs = fractions.len();
    let fraction = if jobs == 0 {
        0.0
    } else {
        fractions.iter().sum::<f64>() / jobs as f64
    };
    AggregateProgress { fraction, jobs }
}
