//! Translating a job's plan into encoder invocations and running them.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, unbounded};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Error, PassKind, Result, Warning};
use crate::job::{Job, Mode};
use crate::orchestrator::CancelToken;
use crate::progress::{PassSpan, ProgressParser};
use crate::solver::{self, Resolution};
use crate::toolchain::{EncoderProcess, MediaInfo, Toolchain};

/// How often a worker waiting on its encoder looks at the cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Resolved encoder settings for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingPlan {
    Quality {
        crf: u32,
        preset: String,
        audio_bitrate: u64,
    },
    /// Always encoded in two passes.
    SizeTarget {
        video_bitrate: u64,
        audio_bitrate: u64,
        preset: String,
        resolution: Option<Resolution>,
    },
}

impl EncodingPlan {
    /// Build the plan for `job`, running the size solver when needed.
    pub fn for_job(
        job: &Job,
        info: &MediaInfo,
        settings: &Settings,
    ) -> Result<(EncodingPlan, Option<Warning>)> {
        match &job.mode {
            Mode::Quality { crf, preset } => Ok((
                EncodingPlan::Quality {
                    crf: *crf,
                    preset: preset.clone(),
                    audio_bitrate: settings.quality_audio_bitrate,
                },
                None,
            )),
            Mode::SizeTarget { target_bytes } => {
                let solution = solver::solve(&job.source, info, *target_bytes, &settings.solver)?;
                Ok((
                    EncodingPlan::SizeTarget {
                        video_bitrate: solution.video_bitrate,
                        audio_bitrate: solution.audio_bitrate,
                        preset: settings.preset.clone(),
                        resolution: solution.resolution,
                    },
                    solution.warning,
                ))
            }
        }
    }

    pub fn two_pass(&self) -> bool {
        matches!(self, EncodingPlan::SizeTarget { .. })
    }
}

impl fmt::Display for EncodingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingPlan::Quality { crf, preset, .. } => write!(f, "crf {} / {}", crf, preset),
            EncodingPlan::SizeTarget {
                video_bitrate,
                resolution,
                ..
            } => {
                write!(f, "2-pass {}k", video_bitrate / 1000)?;
                if let Some(resolution) = resolution {
                    write!(f, " @ {}", resolution)?;
                }
                Ok(())
            }
        }
    }
}

/// One encoder invocation.
#[derive(Debug, Clone)]
pub struct Pass {
    pub kind: PassKind,
    pub args: Vec<OsString>,
    pub span: PassSpan,
}

impl Pass {
    /// Whether this invocation writes the job's destination.
    pub fn writes_destination(&self) -> bool {
        matches!(self.kind, PassKind::Single | PassKind::Encode)
    }
}

/// Argument lists for every pass of `plan`, in order.
pub fn build_passes(
    plan: &EncodingPlan,
    source: &Path,
    destination: &Path,
    passlog: &Path,
    threads: usize,
) -> Vec<Pass> {
    let input = |args: &mut Vec<OsString>| {
        args.extend(["-hide_banner", "-v", "error", "-y", "-i"].map(OsString::from));
        args.push(source.into());
    };
    let video = |args: &mut Vec<OsString>, preset: &str| {
        args.extend(
            ["-c:v", "libx264", "-pix_fmt", "yuv420p", "-preset", preset, "-threads"]
                .map(OsString::from),
        );
        args.push(threads.to_string().into());
    };
    let progress = |args: &mut Vec<OsString>| {
        args.extend(["-progress", "pipe:1", "-nostats"].map(OsString::from));
    };
    let audio = |args: &mut Vec<OsString>, bitrate: u64| {
        args.extend(["-c:a", "aac", "-b:a"].map(OsString::from));
        args.push(bitrate.to_string().into());
        args.extend(["-movflags", "+faststart"].map(OsString::from));
    };

    match plan {
        EncodingPlan::Quality {
            crf,
            preset,
            audio_bitrate,
        } => {
            let mut args = Vec::new();
            input(&mut args);
            video(&mut args, preset.as_str());
            args.push("-crf".into());
            args.push(crf.to_string().into());
            audio(&mut args, *audio_bitrate);
            progress(&mut args);
            args.push(destination.into());
            vec![Pass {
                kind: PassKind::Single,
                args,
                span: PassSpan::WHOLE,
            }]
        }
        EncodingPlan::SizeTarget {
            video_bitrate,
            audio_bitrate,
            preset,
            resolution,
        } => {
            let common = |args: &mut Vec<OsString>, pass: u8| {
                input(args);
                if let Some(r) = resolution {
                    args.push("-vf".into());
                    args.push(format!("scale={}:{}", r.width, r.height).into());
                }
                video(args, preset.as_str());
                args.push("-b:v".into());
                args.push(video_bitrate.to_string().into());
                args.push("-pass".into());
                args.push(pass.to_string().into());
                args.push("-passlogfile".into());
                args.push(passlog.into());
            };

            let mut analysis = Vec::new();
            common(&mut analysis, 1);
            analysis.push("-an".into());
            progress(&mut analysis);
            analysis.extend(["-f", "null", "-"].map(OsString::from));

            let mut encode = Vec::new();
            common(&mut encode, 2);
            audio(&mut encode, *audio_bitrate);
            progress(&mut encode);
            encode.push(destination.into());

            vec![
                Pass {
                    kind: PassKind::Analysis,
                    args: analysis,
                    span: PassSpan::ANALYSIS,
                },
                Pass {
                    kind: PassKind::Encode,
                    args: encode,
                    span: PassSpan::ENCODE,
                },
            ]
        }
    }
}

/// Unique prefix for a job's two-pass statistics files.
pub fn passlog_prefix(job: &Job) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir().join(format!(
        "video_compress-{}-{}-{}-passlog",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed),
        job.id.index()
    ))
}

/// Runs the passes of one job against a toolchain.
pub struct Invoker<'a> {
    toolchain: &'a dyn Toolchain,
    cancel: &'a CancelToken,
    threads: usize,
}

impl<'a> Invoker<'a> {
    pub fn new(toolchain: &'a dyn Toolchain, cancel: &'a CancelToken, threads: usize) -> Self {
        Self {
            toolchain,
            cancel,
            threads,
        }
    }

    /// Encode `job` according to `plan`, reporting job-wide fractions.
    ///
    /// Returns the size of the finished destination. On failure the
    /// destination is removed only if a pass writing it was started.
    pub fn run(
        &self,
        job: &Job,
        plan: &EncodingPlan,
        duration: f64,
        on_progress: &mut dyn FnMut(f64, Option<Duration>),
    ) -> Result<Option<u64>> {
        let passlog = passlog_prefix(job);
        let passes = build_passes(plan, &job.source, &job.destination, &passlog, self.threads);

        let mut wrote_destination = false;
        let result = self.run_passes(job, &passes, duration, on_progress, &mut wrote_destination);

        if plan.two_pass() {
            remove_passlogs(&passlog);
        }

        match result {
            Ok(()) => Ok(fs::metadata(&job.destination).ok().map(|m| m.len())),
            Err(e) => {
                if wrote_destination {
                    remove_partial(&job.destination);
                }
                Err(e)
            }
        }
    }

    fn run_passes(
        &self,
        job: &Job,
        passes: &[Pass],
        duration: f64,
        on_progress: &mut dyn FnMut(f64, Option<Duration>),
        wrote_destination: &mut bool,
    ) -> Result<()> {
        for pass in passes {
            self.run_pass(job, pass, duration, on_progress, wrote_destination)?;
        }
        Ok(())
    }

    fn run_pass(
        &self,
        job: &Job,
        pass: &Pass,
        duration: f64,
        on_progress: &mut dyn FnMut(f64, Option<Duration>),
        wrote_destination: &mut bool,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let failed = |message: String| Error::EncodeFailed {
            path: job.source.clone(),
            pass: pass.kind,
            message,
        };

        debug!("{} starting {} pass", job.id, pass.kind);
        let mut process = self
            .toolchain
            .start(&pass.args)
            .map_err(|e| failed(e.to_string()))?;
        if pass.writes_destination() {
            *wrote_destination = true;
        }

        let (line_tx, line_rx) = unbounded::<String>();
        let reader = process.take_status().map(|status| {
            thread::spawn(move || {
                for line in status.lines().map_while(|l| l.ok()) {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            })
        });

        let mut parser = ProgressParser::new(duration);
        let mut cancelled = false;
        if reader.is_some() {
            loop {
                select! {
                    recv(line_rx) -> line => match line {
                        Ok(line) => {
                            if let Some(fraction) = parser.feed(&line) {
                                on_progress(pass.span.map(fraction), parser.eta());
                            }
                            if parser.ended() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    default(CANCEL_POLL) => {}
                }
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            info!("{} cancelled, stopping encoder", job.id);
            stop(process.as_mut());
            join_reader(reader);
            return Err(Error::Cancelled);
        }

        let exit = process.wait().map_err(|e| failed(e.to_string()))?;
        join_reader(reader);

        if !exit.success {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            return Err(failed(exit.describe()));
        }
        on_progress(pass.span.map(parser.finish()), None);
        Ok(())
    }
}

fn stop(process: &mut dyn EncoderProcess) {
    if let Err(e) = process.kill() {
        warn!("Failed to kill encoder: {}", e);
    }
    if let Err(e) = process.wait() {
        warn!("Failed to reap encoder: {}", e);
    }
}

fn join_reader(reader: Option<thread::JoinHandle<()>>) {
    if let Some(handle) = reader {
        let _ = handle.join();
    }
}

fn remove_partial(destination: &Path) {
    if destination.exists() {
        match fs::remove_file(destination) {
            Ok(()) => debug!("Removed partial output {}", destination.display()),
            Err(e) => warn!("Could not remove partial output {}: {}", destination.display(), e),
        }
    }
}

fn remove_passlogs(prefix: &Path) {
    let (Some(dir), Some(name)) = (prefix.parent(), prefix.file_name()) else {
        return;
    };
    let name = name.to_string_lossy();
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if entry.file_name().to_string_lossy().starts_with(name.as_ref()) {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Could not remove {}: {}", entry.path().display(), e);
            }
        }
    }
}
