use std::time::Duration;

use thiserror::Error;

/// Failures of the byte channel to the target.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Refused {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("key injection failed: {0}")]
    Injector(String),
}

/// Errors that abort a harness run.
///
/// Everything that can go wrong once the target has booted is recorded as a
/// test result instead; only setup failures surface here.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("transport could not be established: {0}")]
    Connect(#[source] TransportError),

    #[error("no shell prompt within {0:?} of boot")]
    BootTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid test suite: {0}")]
    Suite(String),

    #[error("could not write report: {0}")]
    Report(String),

    #[error("emulator failed: {0}")]
    Emulator(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub(crate) fn pattern(pattern: &str, source: regex::Error) -> Self {
        Self::Pattern {
            pattern: pattern.to_string(),
            source,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
