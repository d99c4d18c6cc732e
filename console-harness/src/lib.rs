//! Drives a kernel's interactive serial shell through a suite of commands and
//! records what happened.
//!
//! The target gives no help marking where one command's output ends: the
//! harness decides that from the reappearing shell prompt (or a per-command
//! banner), filters asynchronous log noise out of the capture, and watches
//! every byte for crash signatures.

pub mod case;
pub mod completion;
pub mod config;
pub mod crash;
pub mod dispatch;
pub mod emulator;
pub mod error;
pub mod normalize;
pub mod record;
pub mod report;
pub mod runner;
pub mod session;
pub mod suite;
pub mod transport;
pub mod wait;

pub use case::{TestCase, Validator};
pub use config::{HarnessConfig, Timings};
pub use error::{HarnessError, HarnessResult, TransportError};
pub use record::{ResultRecorder, Status, TestResult};
pub use report::{Reporter, RunInfo};
pub use runner::{run_suite, RunOutcome};
