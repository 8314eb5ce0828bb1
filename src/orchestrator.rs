//! Runs a batch of jobs on a bounded worker pool and aggregates their progress.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::encoder::{EncodingPlan, Invoker};
use crate::error::{Error, Result, Warning};
use crate::job::{unique_destinations, Job, JobId, JobStatus, Mode};
use crate::progress::{AggregateProgress, ProgressBoard, ProgressEvent};
use crate::toolchain::{MediaInfo, Toolchain};

/// Run-wide cancellation flag shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the orchestrator tells whoever renders progress.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started {
        job: JobId,
        source: PathBuf,
    },
    Progress {
        event: ProgressEvent,
        overall: AggregateProgress,
    },
    Finished {
        job: JobId,
        status: JobStatus,
        overall: AggregateProgress,
    },
}

/// Every job of a finished run, in discovery order.
#[derive(Debug)]
pub struct RunReport {
    pub jobs: Vec<Job>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(JobStatus::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    /// Jobs never started because the run was cancelled first.
    pub fn skipped(&self) -> usize {
        self.jobs.iter().filter(|j| !j.is_terminal()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// A job's plan as computed for `--dry-run`.
#[derive(Debug)]
pub struct Preview {
    pub info: MediaInfo,
    pub plan: EncodingPlan,
    pub warning: Option<Warning>,
}

pub struct Orchestrator {
    toolchain: Arc<dyn Toolchain>,
    settings: Settings,
    cancel: CancelToken,
    events: Option<Sender<RunEvent>>,
    board: Mutex<Arc<ProgressBoard>>,
}

impl Orchestrator {
    pub fn new(toolchain: Arc<dyn Toolchain>, settings: Settings) -> Self {
        Self {
            toolchain,
            settings,
            cancel: CancelToken::new(),
            events: None,
            board: Mutex::new(Arc::new(ProgressBoard::new(0))),
        }
    }

    pub fn with_events(mut self, events: Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Overall progress of the current (or last) run.
    pub fn progress(&self) -> AggregateProgress {
        self.current_board().aggregate()
    }

    /// One job per discovered path, in discovery order. No two jobs share a
    /// destination and no destination is another job's source.
    pub fn jobs_for(&self, paths: Vec<PathBuf>, mode: &Mode) -> Vec<Job> {
        let destinations = unique_destinations(&paths, mode);
        paths
            .into_iter()
            .zip(destinations)
            .enumerate()
            .map(|(i, (path, destination))| {
                Job::new(JobId(i), path, mode.clone()).with_destination(destination)
            })
            .collect()
    }

    /// Probe and plan every job without encoding anything.
    pub fn preview(&self, jobs: &[Job]) -> Result<Vec<Result<Preview>>> {
        let pool = self.build_pool(jobs.len())?;
        Ok(pool.install(|| {
            jobs.par_iter()
                .map(|job| -> Result<Preview> {
                    let info = self.toolchain.probe(&job.source)?;
                    let (plan, warning) = EncodingPlan::for_job(job, &info, &self.settings)?;
                    Ok(Preview {
                        info,
                        plan,
                        warning,
                    })
                })
                .collect()
        }))
    }

    /// Run every job to a terminal state.
    ///
    /// Individual failures never stop the batch; the only error returned is
    /// failing to build the worker pool.
    pub fn run(&self, jobs: Vec<Job>) -> Result<RunReport> {
        let start = Instant::now();
        let total = jobs.len();
        let board = Arc::new(ProgressBoard::new(total));
        *self.board.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&board);

        let pool = self.build_pool(total)?;
        let workers = self.settings.workers.min(total).max(1);
        info!("Running {} job(s) on {} worker(s)", total, workers);

        let (queue_tx, queue_rx) = unbounded::<Job>();
        for job in jobs {
            // Receiver is alive, cannot fail.
            let _ = queue_tx.send(job);
        }
        drop(queue_tx);

        let finished = Mutex::new(Vec::with_capacity(total));
        pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    while let Ok(mut job) = queue_rx.recv() {
                        if self.cancel.is_cancelled() {
                            debug!("{} skipped, run cancelled", job.id);
                        } else {
                            self.process(&mut job, &board);
                        }
                        finished.lock().unwrap_or_else(|e| e.into_inner()).push(job);
                    }
                });
            }
        });

        let mut jobs = finished.into_inner().unwrap_or_else(|e| e.into_inner());
        jobs.sort_by_key(|job| job.id);

        let report = RunReport {
            jobs,
            cancelled: self.cancel.is_cancelled(),
            elapsed: start.elapsed(),
        };
        info!(
            "Run finished: {} succeeded, {} failed, {} skipped in {:.2}s",
            report.succeeded(),
            report.failed(),
            report.skipped(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    fn process(&self, job: &mut Job, board: &ProgressBoard) {
        job.start();
        info!("Starting {}: {}", job.id, job.source.display());
        self.emit(RunEvent::Started {
            job: job.id,
            source: job.source.clone(),
        });

        match self.execute(job, board) {
            Ok(output_bytes) => {
                board.update(job.id, 1.0);
                job.succeed(output_bytes);
                match output_bytes {
                    Some(bytes) => info!(
                        "Completed {}: {} -> {:.2} MB",
                        job.id,
                        job.destination.display(),
                        bytes as f64 / (1024.0 * 1024.0)
                    ),
                    None => info!("Completed {}: {}", job.id, job.destination.display()),
                }
            }
            Err(e) => {
                job.advance(board.get(job.id));
                match e {
                    Error::Cancelled => warn!("Cancelled {}: {}", job.id, job.source.display()),
                    ref e => error!("Error {}: {}", job.id, e),
                }
                job.fail(e);
            }
        }

        self.emit(RunEvent::Finished {
            job: job.id,
            status: job.status,
            overall: board.aggregate(),
        });
    }

    fn execute(&self, job: &mut Job, board: &ProgressBoard) -> Result<Option<u64>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let info = self.toolchain.probe(&job.source)?;
        let (plan, warning) = EncodingPlan::for_job(job, &info, &self.settings)?;
        debug!("{} plan: {}", job.id, plan);
        job.warnings.extend(warning);

        let id = job.id;
        let mut on_progress = |fraction: f64, eta: Option<Duration>| {
            let overall = board.update(id, fraction);
            self.emit(RunEvent::Progress {
                event: ProgressEvent {
                    job: id,
                    fraction: board.get(id),
                    eta,
                },
                overall,
            });
        };
        let invoker = Invoker::new(
            self.toolchain.as_ref(),
            &self.cancel,
            self.settings.encoder_threads,
        );
        invoker.run(job, &plan, info.duration, &mut on_progress)
    }

    fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.events {
            if tx.send(event).is_err() {
                debug!("No listener for run events");
            }
        }
    }

    fn current_board(&self) -> Arc<ProgressBoard> {
        Arc::clone(&self.board.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn build_pool(&self, jobs: usize) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.min(jobs).max(1))
            .thread_name(|i| format!("encode-{}", i))
            .build()
            .map_err(|e| Error::InvalidArgument(format!("worker pool: {}", e)))
    }
}
