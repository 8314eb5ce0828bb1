use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use video_compress::config::{DEFAULT_CRF, DEFAULT_PRESET, DEFAULT_WORKERS};
use video_compress::{
    discover_videos, Error, Ffmpeg, JobId, JobStatus, Mode, Orchestrator, Preview, RunEvent,
    RunReport, Settings,
};

/// Bar resolution; fractions are scaled to this many positions.
const BAR_LEN: u64 = 1000;

#[derive(Parser)]
#[command(name = "compress")]
#[command(about = "Batch-compresses videos with ffmpeg, at a fixed quality or to a target size")]
struct Args {
    /// Video files or directories. A leading number (e.g. `5`) is a target size in MiB
    inputs: Vec<String>,

    /// Target size per output in MiB (selects size-target mode)
    #[arg(short = 's', long)]
    target_mb: Option<f64>,

    /// Constant Rate Factor for quality mode (0-51, lower is better quality)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CRF)]
    crf: u32,

    /// x264 preset
    #[arg(short = 'p', long, default_value = DEFAULT_PRESET)]
    preset: String,

    /// Number of videos encoded in parallel
    #[arg(short = 'j', long, default_value_t = DEFAULT_WORKERS)]
    jobs: usize,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Probe and plan every file without encoding
    #[arg(long)]
    dry_run: bool,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Error> {
    let (size_token, inputs) = split_size_token(args.inputs);
    let target_mb = args.target_mb.or(size_token);

    let mut settings = Settings::with_workers(args.jobs);
    settings.crf = args.crf;
    settings.preset = args.preset;
    settings.ffmpeg = args.ffmpeg;
    settings.ffprobe = args.ffprobe;
    settings.validate()?;

    let mode = match target_mb {
        Some(mb) if mb > 0.0 => Mode::SizeTarget {
            target_bytes: (mb * 1024.0 * 1024.0) as u64,
        },
        Some(mb) => {
            return Err(Error::InvalidArgument(format!(
                "target size must be positive, got {}",
                mb
            )))
        }
        None => Mode::Quality {
            crf: settings.crf,
            preset: settings.preset.clone(),
        },
    };

    let videos = discover_videos(&inputs)?;
    if videos.is_empty() {
        println!("No supported video files found.");
        return Ok(ExitCode::SUCCESS);
    }

    let toolchain = Ffmpeg::new(&settings.ffmpeg, &settings.ffprobe);
    if !toolchain.is_installed() {
        return Err(Error::InvalidArgument(format!(
            "{} / {} not found or not runnable",
            settings.ffmpeg.display(),
            settings.ffprobe.display()
        )));
    }

    match &mode {
        Mode::Quality { crf, preset } => println!("Mode: quality (CRF {}, preset {})", crf, preset),
        Mode::SizeTarget { target_bytes } => println!(
            "Mode: size target ({:.2} MiB, two-pass)",
            *target_bytes as f64 / (1024.0 * 1024.0)
        ),
    }
    println!(
        "Found {} video(s), using {} parallel encodes",
        videos.len(),
        settings.workers
    );

    let (event_tx, event_rx) = unbounded();
    let orchestrator = Orchestrator::new(Arc::new(toolchain), settings).with_events(event_tx);
    let jobs = orchestrator.jobs_for(videos, &mode);

    if args.dry_run {
        let previews = orchestrator.preview(&jobs)?;
        for (job, preview) in jobs.iter().zip(previews) {
            print_preview(&job.source, &job.destination, preview);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = orchestrator.cancel_token();
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            // Second Ctrl+C: give up immediately.
            std::process::exit(130);
        }
        eprintln!("\nCancelling, stopping running encodes...");
        cancel.cancel();
    }) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let total = jobs.len();
    let names: HashMap<JobId, String> = jobs
        .iter()
        .map(|job| (job.id, display_name(&job.source)))
        .collect();
    let show_progress = !args.no_progress;
    let renderer = thread::spawn(move || render(event_rx, names, total, show_progress));

    let report = orchestrator.run(jobs)?;
    // Closes the event channel so the renderer drains and exits.
    drop(orchestrator);
    let _ = renderer.join();

    print_report(&report);

    Ok(if report.cancelled {
        ExitCode::from(130)
    } else if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// A leading positive number that is not an existing path is a size target in MiB.
fn split_size_token(mut inputs: Vec<String>) -> (Option<f64>, Vec<String>) {
    let target = inputs.first().and_then(|first| {
        if Path::new(first).exists() {
            return None;
        }
        first.parse::<f64>().ok().filter(|mb| *mb > 0.0)
    });
    if target.is_some() {
        inputs.remove(0);
    }
    (target, inputs)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn render(events: Receiver<RunEvent>, names: HashMap<JobId, String>, total: usize, show: bool) {
    let multi = if show {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };

    let overall = multi.add(ProgressBar::new(BAR_LEN));
    overall.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    overall.enable_steady_tick(Duration::from_millis(100));
    overall.set_message(format!("0/{} done", total));

    let job_style = ProgressStyle::default_bar()
        .template("  {prefix:30!} [{bar:30.green/white}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

    let mut bars: HashMap<JobId, ProgressBar> = HashMap::new();
    let mut done = 0;
    for event in events {
        match event {
            RunEvent::Started { job, .. } => {
                let bar = multi.add(ProgressBar::new(BAR_LEN));
                bar.set_style(job_style.clone());
                bar.set_prefix(names.get(&job).cloned().unwrap_or_else(|| job.to_string()));
                bars.insert(job, bar);
            }
            RunEvent::Progress { event, overall: agg } => {
                if let Some(bar) = bars.get(&event.job) {
                    bar.set_position((event.fraction * BAR_LEN as f64) as u64);
                    if let Some(eta) = event.eta {
                        bar.set_message(format!("eta {}", format_duration(eta)));
                    }
                }
                overall.set_position((agg.fraction * BAR_LEN as f64) as u64);
            }
            RunEvent::Finished {
                job,
                status,
                overall: agg,
            } => {
                done += 1;
                if let Some(bar) = bars.remove(&job) {
                    match status {
                        JobStatus::Done => bar.finish_with_message("done"),
                        _ => bar.abandon_with_message("failed"),
                    }
                }
                overall.set_position((agg.fraction * BAR_LEN as f64) as u64);
                overall.set_message(format!("{}/{} done", done, total));
            }
        }
    }
    overall.finish_with_message(format!("{}/{} done", done, total));
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn print_preview(source: &Path, destination: &Path, preview: video_compress::Result<Preview>) {
    match preview {
        Ok(preview) => {
            let info = &preview.info;
            println!(
                "{} ({}, {}x{}, {}, {}) -> {} [{}]",
                source.display(),
                info.codec.as_deref().unwrap_or("?"),
                info.width,
                info.height,
                format_duration(Duration::from_secs_f64(info.duration.max(0.0))),
                info.bit_rate
                    .map_or_else(|| "?".to_string(), |b| format!("{}k", b / 1000)),
                destination.display(),
                preview.plan
            );
            if let Some(warning) = preview.warning {
                println!("  warning: {}", warning);
            }
        }
        Err(e) => println!("{} -> error: {}", source.display(), e),
    }
}

fn print_report(report: &RunReport) {
    println!("\nCompression Summary:");
    for job in &report.jobs {
        let detail = match (&job.status, &job.error) {
            (JobStatus::Done, _) => job.output_bytes.map_or_else(
                || job.destination.display().to_string(),
                |bytes| {
                    format!(
                        "{} ({:.2} MB)",
                        job.destination.display(),
                        bytes as f64 / (1024.0 * 1024.0)
                    )
                },
            ),
            (_, Some(e)) => e.to_string(),
            (JobStatus::Pending, None) => "not started".to_string(),
            _ => String::new(),
        };
        println!("  {:<8} {} {}", job.status.to_string(), job.source.display(), detail);
        for warning in &job.warnings {
            println!("           warning: {}", warning);
        }
    }
    println!("Succeeded: {}", report.succeeded());
    println!("Failed: {}", report.failed());
    println!("Skipped: {}", report.skipped());
    if report.cancelled {
        println!("Run was cancelled");
    }
    println!("Time taken: {:.2} seconds", report.elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn leading_number_selects_size_mode() {
        let (target, inputs) = split_size_token(strings(&["5", "a.mp4"]));
        assert_eq!(target, Some(5.0));
        assert_eq!(inputs, strings(&["a.mp4"]));
    }

    #[test]
    fn plain_inputs_stay_in_quality_mode() {
        let (target, inputs) = split_size_token(strings(&["a.mp4", "5"]));
        assert_eq!(target, None);
        assert_eq!(inputs.len(), 2);

        let (target, _) = split_size_token(strings(&["-3", "a.mp4"]));
        assert_eq!(target, None);
    }

    #[test]
    fn existing_path_named_like_a_number_is_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let numbered = dir.path().join("5");
        std::fs::create_dir(&numbered).unwrap();
        let arg = numbered.to_string_lossy().into_owned();
        let (target, inputs) = split_size_token(vec![arg.clone()]);
        assert_eq!(target, None);
        assert_eq!(inputs, vec![arg]);
    }

    #[test]
    fn durations_format_like_a_clock() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn cli_parses_flags() {
        let args = Args::try_parse_from(["compress", "-c", "24", "-j", "2", "--dry-run", "dir"])
            .unwrap();
        assert_eq!(args.crf, 24);
        assert_eq!(args.jobs, 2);
        assert!(args.dry_run);
        assert_eq!(args.inputs, strings(&["dir"]));
    }
}
