//! Scripted stand-in for ffmpeg/ffprobe used by the unit tests.

use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};
use crate::toolchain::{EncoderProcess, MediaInfo, ProcessExit, Toolchain};

/// What a fake encoder prints and how it exits.
#[derive(Debug, Clone)]
pub struct Script {
    lines: Vec<String>,
    exit: ProcessExit,
    block: bool,
}

impl Script {
    pub fn success(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit: ProcessExit {
                success: true,
                code: Some(0),
                diagnostics: String::new(),
            },
            block: false,
        }
    }

    pub fn failure(code: i32, stderr: &str) -> Self {
        Self {
            lines: vec!["out_time_us=1000000".into()],
            exit: ProcessExit {
                success: false,
                code: Some(code),
                diagnostics: stderr.into(),
            },
            block: false,
        }
    }

    /// Prints one progress line, then runs until killed.
    pub fn blocking() -> Self {
        Self {
            lines: vec!["out_time_us=1000000".into()],
            block: true,
            ..Self::success(&[])
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    killed: AtomicUsize,
}

pub struct FakeToolchain {
    default: Script,
    overrides: Vec<(String, Script)>,
    failing_probes: Vec<String>,
    info: MediaInfo,
    line_delay: Duration,
    invocations: Mutex<Vec<Vec<OsString>>>,
    counters: Arc<Counters>,
}

impl FakeToolchain {
    /// Bytes the fake writes to the output path of every invocation.
    pub const OUTPUT: &'static [u8] = b"encoded";

    pub fn new(default: Script) -> Self {
        Self {
            default,
            overrides: Vec::new(),
            failing_probes: Vec::new(),
            info: MediaInfo {
                duration: 10.0,
                width: 1920,
                height: 1080,
                codec: Some("h264".into()),
                bit_rate: Some(4_000_000),
            },
            line_delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use `script` for invocations whose arguments mention `fragment`.
    pub fn with_script_for(mut self, fragment: &str, script: Script) -> Self {
        self.overrides.push((fragment.to_string(), script));
        self
    }

    pub fn with_failing_probe(mut self, fragment: &str) -> Self {
        self.failing_probes.push(fragment.to_string());
        self
    }

    pub fn with_info(mut self, info: MediaInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn started(&self) -> usize {
        self.counters.started.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.counters.max_running.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.counters.killed.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Vec<OsString>> {
        self.invocations.lock().unwrap().clone()
    }

    /// Block until `n` processes are running at once.
    pub fn wait_for_running(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.running() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {} running", n);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn script_for(&self, args: &[OsString]) -> Script {
        self.overrides
            .iter()
            .find(|(fragment, _)| {
                args.iter()
                    .any(|a| a.to_string_lossy().contains(fragment.as_str()))
            })
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Toolchain for FakeToolchain {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let name = path.to_string_lossy();
        if self.failing_probes.iter().any(|f| name.contains(f.as_str())) {
            return Err(Error::probe_failed(path, "moov atom not found"));
        }
        Ok(self.info.clone())
    }

    fn start(&self, args: &[OsString]) -> io::Result<Box<dyn EncoderProcess>> {
        self.invocations.lock().unwrap().push(args.to_vec());
        let script = self.script_for(args);

        if let Some(output) = args.last().filter(|a| a.as_os_str() != "-") {
            fs::write(output, Self::OUTPUT)?;
        }

        let counters = Arc::clone(&self.counters);
        counters.started.fetch_add(1, Ordering::SeqCst);
        let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_running.fetch_max(now, Ordering::SeqCst);

        let (data_tx, data_rx) = unbounded::<Vec<u8>>();
        let (kill_tx, kill_rx) = bounded::<()>(1);
        let lines = script.lines.clone();
        let block = script.block;
        let delay = self.line_delay;
        thread::spawn(move || feed(lines, block, delay, data_tx, kill_rx));

        Ok(Box::new(FakeProcess {
            status: Some(ChannelReader {
                rx: data_rx,
                pending: Vec::new(),
            }),
            kill_tx: Some(kill_tx),
            exit: script.exit,
            killed: false,
            reaped: false,
            counters,
        }))
    }
}

fn feed(
    lines: Vec<String>,
    block: bool,
    delay: Duration,
    data_tx: Sender<Vec<u8>>,
    kill_rx: Receiver<()>,
) {
    for line in lines {
        if data_tx.send(format!("{}\n", line).into_bytes()).is_err() {
            return;
        }
        match kill_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
    if block {
        let _ = kill_rx.recv();
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeProcess {
    status: Option<ChannelReader>,
    kill_tx: Option<Sender<()>>,
    exit: ProcessExit,
    killed: bool,
    reaped: bool,
    counters: Arc<Counters>,
}

impl EncoderProcess for FakeProcess {
    fn take_status(&mut self) -> Option<Box<dyn BufRead + Send>> {
        self.status
            .take()
            .map(|r| Box::new(BufReader::new(r)) as Box<dyn BufRead + Send>)
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.kill_tx.take().is_some() {
            self.killed = true;
            self.counters.killed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        if !self.reaped {
            self.reaped = true;
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
        if self.killed {
            return Ok(ProcessExit {
                success: false,
                code: None,
                diagnostics: String::new(),
            });
        }
        Ok(self.exit.clone())
    }
}
