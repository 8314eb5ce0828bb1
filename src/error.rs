use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a batch run.
///
/// `NoInputProvided` and `PathNotFound` abort the run before any job exists.
/// `ProbeFailed`, `EncodeFailed` and `Cancelled` are scoped to a single job and
/// end up in that job's outcome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no input paths provided")]
    NoInputProvided,

    #[error("path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    #[error("probe failed for {}: {message}", path.display())]
    ProbeFailed { path: PathBuf, message: String },

    #[error("{pass} pass failed for {}: {message}", path.display())]
    EncodeFailed {
        path: PathBuf,
        pass: PassKind,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn probe_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ProbeFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Setup errors stop the run before any encoder is started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::NoInputProvided | Self::PathNotFound { .. } | Self::InvalidArgument(_)
        )
    }

    /// Process exit code for an error that ended the whole run.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Cancelled => 130,
            e if e.is_setup() => 2,
            _ => 1,
        }
    }
}

/// Which encoder invocation of a job is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Quality mode, one invocation straight to the destination.
    Single,
    /// First of two passes; output discarded, writes the bitrate log.
    Analysis,
    /// Second of two passes; consumes the bitrate log.
    Encode,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassKind::Single => "single",
            PassKind::Analysis => "analysis",
            PassKind::Encode => "encode",
        })
    }
}

/// Non-fatal conditions attached to a successful job.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// No ladder tier reached the floor bitrate; the output may exceed the target.
    PartialLadderExhausted {
        target_bytes: u64,
        predicted_bytes: u64,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::PartialLadderExhausted {
                target_bytes,
                predicted_bytes,
            } => write!(
                f,
                "resolution ladder exhausted, predicted {} bytes for a {} byte target",
                predicted_bytes, target_bytes
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_errors_are_classified() {
        assert!(Error::NoInputProvided.is_setup());
        assert!(Error::PathNotFound { path: "x".into() }.is_setup());
        assert!(!Error::Cancelled.is_setup());
        assert!(!Error::probe_failed("a.mp4", "boom").is_setup());
    }

    #[test]
    fn exit_codes_follow_the_error_kind() {
        assert_eq!(Error::NoInputProvided.exit_code(), 2);
        assert_eq!(Error::InvalidArgument("jobs".into()).exit_code(), 2);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.exit_code(), 1);
    }

    #[test]
    fn encode_failure_names_the_pass() {
        let err = Error::EncodeFailed {
            path: "a.mp4".into(),
            pass: PassKind::Analysis,
            message: "exit code 1".into(),
        };
        assert_eq!(err.to_string(), "analysis pass failed for a.mp4: exit code 1");
    }
}
