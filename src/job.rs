use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Warning};

/// Position of a job in discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub usize);

impl JobId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

/// Compression strategy for a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Quality { crf: u32, preset: String },
    SizeTarget { target_bytes: u64 },
}

impl Mode {
    fn suffix(&self) -> &'static str {
        match self {
            Mode::Quality { .. } => "compressed",
            Mode::SizeTarget { .. } => "smaller",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        })
    }
}

/// One input file to convert. Owned by a single worker while it runs.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: Mode,
    pub status: JobStatus,
    pub progress: f64,
    pub error: Option<Error>,
    pub warnings: Vec<Warning>,
    pub output_bytes: Option<u64>,
}

impl Job {
    pub fn new(id: JobId, source: PathBuf, mode: Mode) -> Self {
        let destination = destination_for(&source, &mode);
        Self {
            id,
            source,
            destination,
            mode,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            warnings: Vec::new(),
            output_bytes: None,
        }
    }

    pub fn with_destination(mut self, destination: PathBuf) -> Self {
        self.destination = destination;
        self
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
    }

    /// Record progress; ignored unless running and never lowers the value.
    pub fn advance(&mut self, fraction: f64) {
        if self.status == JobStatus::Running {
            self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
        }
    }

    pub fn succeed(&mut self, output_bytes: Option<u64>) {
        self.status = JobStatus::Done;
        self.progress = 1.0;
        self.output_bytes = output_bytes;
    }

    pub fn fail(&mut self, error: Error) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::Failed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(Error::Cancelled))
    }
}

/// `<stem>_<suffix>.mp4` beside the source.
pub fn destination_for(source: &Path, mode: &Mode) -> PathBuf {
    numbered_destination(source, mode, 0)
}

fn numbered_destination(source: &Path, mode: &Mode, n: usize) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match n {
        0 => format!("{}_{}.mp4", stem, mode.suffix()),
        n => format!("{}_{}_{}.mp4", stem, mode.suffix(), n),
    };
    source.with_file_name(name)
}

/// One destination per source, in order, none equal to another destination
/// or to any source. A taken name gets a `_1`, `_2`, ... suffix.
pub fn unique_destinations(sources: &[PathBuf], mode: &Mode) -> Vec<PathBuf> {
    let taken: HashSet<&Path> = sources.iter().map(PathBuf::as_path).collect();
    let mut assigned = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let destination = (0..)
                .map(|n| numbered_destination(source, mode, n))
                .find(|candidate| {
                    !taken.contains(candidate.as_path()) && !assigned.contains(candidate)
                })
                .unwrap_or_else(|| destination_for(source, mode));
            assigned.insert(destination.clone());
            destination
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality() -> Mode {
        Mode::Quality {
            crf: 30,
            preset: "slow".into(),
        }
    }

    #[test]
    fn destination_follows_mode() {
        let src = Path::new("/videos/a.mp4");
        assert_eq!(destination_for(src, &quality()), Path::new("/videos/a_compressed.mp4"));
        assert_eq!(
            destination_for(src, &Mode::SizeTarget { target_bytes: 1 }),
            Path::new("/videos/a_smaller.mp4")
        );
        assert_eq!(
            destination_for(Path::new("/videos/clip.MKV"), &quality()),
            Path::new("/videos/clip_compressed.mp4")
        );
    }

    #[test]
    fn destination_never_equals_source() {
        for name in ["a_compressed.mp4", "a_smaller.mp4", "a.mp4", "noext"] {
            let src = PathBuf::from("/v").join(name);
            assert_ne!(destination_for(&src, &quality()), src);
            assert_ne!(destination_for(&src, &Mode::SizeTarget { target_bytes: 1 }), src);
        }
    }

    #[test]
    fn shared_stems_get_distinct_destinations() {
        let mode = quality();
        let sources: Vec<PathBuf> = ["/v/a.mp4", "/v/a.mkv", "/v/a.webm", "/w/a.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let destinations = unique_destinations(&sources, &mode);
        assert_eq!(
            destinations,
            [
                "/v/a_compressed.mp4",
                "/v/a_compressed_1.mp4",
                "/v/a_compressed_2.mp4",
                "/w/a_compressed.mp4",
            ]
            .map(PathBuf::from)
        );
    }

    #[test]
    fn destination_never_overwrites_another_source() {
        // A second run over a folder that already holds an earlier output.
        let sources: Vec<PathBuf> = ["/v/a.mp4", "/v/a_compressed.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let destinations = unique_destinations(&sources, &quality());
        assert_eq!(destinations[0], Path::new("/v/a_compressed_1.mp4"));
        assert_eq!(destinations[1], Path::new("/v/a_compressed_compressed.mp4"));
        for destination in &destinations {
            assert!(!sources.contains(destination));
        }
    }

    #[test]
    fn lifecycle() {
        let mut job = Job::new(JobId(0), "/v/a.mp4".into(), quality());
        assert_eq!(job.status, JobStatus::Pending);
        job.advance(0.5);
        assert_eq!(job.progress, 0.0);

        job.start();
        job.advance(0.5);
        job.advance(0.3);
        assert_eq!(job.progress, 0.5);

        assert!(!job.is_terminal());
        job.succeed(Some(1234));
        assert!(job.is_terminal());
        assert_eq!(job.progress, 1.0);
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_keeps_error() {
        let mut job = Job::new(JobId(2), "/v/a.mp4".into(), quality());
        job.start();
        job.fail(Error::Cancelled);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.is_cancelled());
        assert_eq!(job.id.to_string(), "#3");
    }
}
