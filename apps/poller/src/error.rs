use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;

/// Rejected attempt to build a [`ProbeOutcome`](crate::monitoring::ProbeOutcome)
#[derive(Debug, Error, PartialEq)]
pub enum OutcomeError {
    #[error("reachable outcome needs at least one reply")]
    NoReplies,
    #[error("received {received} replies for {sent} probes")]
    MoreRepliesThanProbes { sent: u32, received: u32 },
    #[error("packet loss {0}% is outside 0..=100")]
    LossOutOfRange(u8),
    #[error("invalid round-trip time {0}")]
    InvalidRtt(f64),
}

/// Why a single roster line was skipped
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterIssue {
    #[error("expected `<address>,<cadenceSeconds>`")]
    MissingField,
    #[error("expected exactly two fields, found {0}")]
    ExtraFields(usize),
    #[error("address is empty")]
    EmptyAddress,
    #[error("address `{0}` would be read as a probe option or contains whitespace")]
    UnsafeAddress(String),
    #[error("cadence `{0}` is not an integer")]
    InvalidCadence(String),
    #[error("cadence {0} must be positive")]
    NonPositiveCadence(i64),
    #[error("cadence {cadence} exceeds the maximum of {max} seconds")]
    CadenceTooLarge { cadence: i64, max: u64 },
    #[error("address `{address}` already defined on line {first_line}")]
    DuplicateAddress { address: String, first_line: usize },
}

/// A skipped roster line with its position
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line_number}: {issue} (`{line}`)")]
pub struct RosterLineError {
    pub line_number: usize,
    pub line: String,
    pub issue: RosterIssue,
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("cannot read roster {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: IoError,
    },
}

/// Failure of one probe process. Always converted into per-host outcomes.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start probe process: {0}")]
    Start(#[source] IoError),
    #[error("failed waiting for probe process: {0}")]
    Wait(#[source] IoError),
    #[error("failed reading probe output: {0}")]
    OutputRead(#[source] IoError),
    #[error("probe output not ready {0:?} after exit")]
    OutputTimeout(std::time::Duration),
    #[error("output drain task aborted")]
    DrainAborted,
}

/// A batch the worker pool refused
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("probe queue is full")]
    QueueFull,
    #[error("probe pool is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("cannot write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no config directory: neither XDG_CONFIG_HOME nor HOME is set")]
    PathUnavailable,
    #[error("invalid config: {0}")]
    Invalid(String),
}
