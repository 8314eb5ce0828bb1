//! Batch video compression on top of an external ffmpeg toolchain.
//!
//! Inputs are expanded by [`discover_videos`], turned into [`Job`]s and run by an
//! [`Orchestrator`] on a bounded worker pool. Each job is either encoded at a
//! fixed quality or, in size-target mode, solved for a bitrate and resolution
//! and encoded in two passes. Progress is published as [`RunEvent`]s.

pub mod config;
pub mod discover;
pub mod encoder;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod solver;
pub mod toolchain;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use discover::discover_videos;
pub use encoder::EncodingPlan;
pub use error::{Error, PassKind, Result, Warning};
pub use job::{Job, JobId, JobStatus, Mode};
pub use orchestrator::{CancelToken, Orchestrator, Preview, RunEvent, RunReport};
pub use progress::{AggregateProgress, ProgressEvent};
pub use toolchain::{Ffmpeg, MediaInfo, Toolchain};
