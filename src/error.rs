//! Error taxonomy for the orchestration core
//!
//! Every failure that can drive the phase sequencer into its `FAILED` state is
//! one variant of [`Error`]. Application-level code (CLI, config loading, the
//! store service) wraps these in `anyhow` with context, the core itself keeps
//! them typed so callers can tell a peer failure from a crashed executable.

use std::path::PathBuf;
use std::time::Duration;

use crate::study::Phase;

/// Result type for the orchestration core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the resolver, barrier, orchestrator and sequencer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required personal field was never published before the deadline
    #[error("parameter {key} for participant {participant} was never published")]
    MissingParameter { participant: String, key: String },

    /// External executable exited with a nonzero status
    #[error("{phase} executable failed (exit code: {})", describe_exit(.exit_code))]
    Process { phase: Phase, exit_code: Option<i32> },

    /// External executable or proxy helper could not be started
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Coordination store unreachable or returned a protocol error
    #[error("coordination store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// A peer published the FAILED status while we were waiting on it
    #[error("participant {participant} failed while waiting at phase '{phase}'")]
    PeerFailed { participant: String, phase: Phase },

    /// An injected deadline expired
    #[error("timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout { waiting_for: String, elapsed: Duration },

    /// The wait was cancelled from outside
    #[error("cancelled while waiting for {waiting_for}")]
    Cancelled { waiting_for: String },

    /// Role outside the protocol range
    #[error("role {0} is outside the supported range 0..={max}", max = crate::study::Role::MAX)]
    InvalidRole(u8),

    /// Role has no participant in the study
    #[error("role {role} has no participant (study has {participants} participants)")]
    UnknownRole { role: u8, participants: usize },

    /// Local data-root marker file missing or unusable
    #[error("data root marker {}: {reason}", path.display())]
    DataRoot { path: PathBuf, reason: String },

    /// Filesystem error with context
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

impl Error {
    /// Wrap an IO error with a short description of what was attempted
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a store error from anything printable
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable {
            reason: format!("{:#}", reason),
        }
    }
}
