//! The external encoder toolchain, seen as a capability: probe a file for
//! metadata, or start an encoder process from an argument list.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::{Error, Result};

/// Lines of stderr kept for the failure message.
const DIAGNOSTIC_TAIL: usize = 20;

/// What the probe knows about a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Seconds; 0.0 when the container does not report a usable duration.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
    pub bit_rate: Option<u64>,
}

/// How an encoder process ended.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub success: bool,
    pub code: Option<i32>,
    /// Tail of the process's error output.
    pub diagnostics: String,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        let code = self
            .code
            .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {}", c));
        if self.diagnostics.trim().is_empty() {
            code
        } else {
            format!("{}: {}", code, self.diagnostics.trim())
        }
    }
}

/// A running encoder.
pub trait EncoderProcess: Send {
    /// Hand out the status stream; `None` once taken.
    fn take_status(&mut self) -> Option<Box<dyn BufRead + Send>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<ProcessExit>;
}

pub trait Toolchain: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaInfo>;
    fn start(&self, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>>;
}

/// ffmpeg/ffprobe found on `PATH` or at explicit locations.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn is_installed(&self) -> bool {
        [&self.ffmpeg, &self.ffprobe].iter().all(|program| {
            Command::new(program)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        })
    }
}

impl Toolchain for Ffmpeg {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("format=duration:stream=width,height,codec_name,bit_rate")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .map_err(|e| Error::probe_failed(path, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::probe_failed(path, stderr.trim()));
        }
        parse_probe_output(path, &output.stdout)
    }

    fn start(&self, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>> {
        debug!("Spawning {} {:?}", self.ffmpeg.display(), args);
        let mut child = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stderr must be drained concurrently or a chatty encoder blocks on a full pipe.
        let stderr = child.stderr.take();
        let stderr_tail = stderr.map(|stream| thread::spawn(move || tail_lines(stream)));
        Ok(Box::new(FfmpegProcess { child, stderr_tail }))
    }
}

struct FfmpegProcess {
    child: Child,
    stderr_tail: Option<JoinHandle<String>>,
}

impl EncoderProcess for FfmpegProcess {
    fn take_status(&mut self) -> Option<Box<dyn BufRead + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(BufReader::new(stdout)) as Box<dyn BufRead + Send>)
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait()?;
        let diagnostics = self
            .stderr_tail
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(ProcessExit {
            success: status.success(),
            code: status.code(),
            diagnostics,
        })
    }
}

fn tail_lines(stream: impl Read) -> String {
    let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
    for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
        if tail.len() == DIAGNOSTIC_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Parse `ffprobe -of json` output for the first video stream.
pub fn parse_probe_output(path: &Path, stdout: &[u8]) -> Result<MediaInfo> {
    let json: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| Error::probe_failed(path, e.to_string()))?;

    // Live recordings often report "N/A"; only size targeting needs a duration.
    let duration = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or_else(|| {
            debug!("No usable duration for {}", path.display());
            0.0
        });

    let stream = json
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .ok_or_else(|| Error::probe_failed(path, "no video stream"))?;

    let dimension = |key: &str| {
        stream
            .get(key)
            .and_then(|v| v.as_u64())
            .filter(|v| *v > 0)
            .map(|v| v as u32)
            .ok_or_else(|| Error::probe_failed(path, format!("missing {}", key)))
    };

    Ok(MediaInfo {
        duration,
        width: dimension("width")?,
        height: dimension("height")?,
        codec: stream
            .get("codec_name")
            .and_then(|c| c.as_str())
            .map(String::from),
        bit_rate: stream
            .get("bit_rate")
            .and_then(|b| b.as_str())
            .and_then(|b| b.parse().ok()),
    })
}
