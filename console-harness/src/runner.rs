//! One complete run: boot wait, then every test case, then the totals.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;

use crate::case::TestCase;
use crate::completion::PromptPattern;
use crate::config::HarnessConfig;
use crate::crash::CrashScanner;
use crate::dispatch::Dispatcher;
use crate::emulator::Liveness;
use crate::error::HarnessResult;
use crate::record::ResultRecorder;
use crate::report::RunInfo;
use crate::session::Session;
use crate::transport::TransportChannel;

#[derive(Debug)]
pub struct RunOutcome {
    pub info: RunInfo,
    pub recorder: ResultRecorder,
}

/// Waits for the target's shell, then runs `cases` in order.
///
/// Fails only if the configuration is unusable, the transport dies before
/// the shell appears, or the shell never appears. Everything after that ends
/// up in the returned recorder.
pub async fn run_suite<T: TransportChannel>(
    transport: T,
    config: &HarnessConfig,
    cases: &[TestCase],
    liveness: &mut dyn Liveness,
) -> HarnessResult<RunOutcome> {
    let started = Utc::now();
    let prompt = Arc::new(PromptPattern::new(&config.prompt)?);
    let scanner = CrashScanner::new(config.crash_signatures.as_slice())?;
    let dispatcher = Dispatcher::from_config(config, Arc::clone(&prompt))?;
    let target = transport.describe();

    let mut session = Session::new(transport, scanner, prompt, config.timings);
    let boot_duration = session.wait_for_boot(config.timings.boot_timeout).await?;

    tracing::info!(tests = cases.len(), "Running tests");
    let test_start = Instant::now();
    let mut recorder = ResultRecorder::new();
    dispatcher.run(&mut session, cases, &mut recorder, liveness).await;
    let test_duration = test_start.elapsed();

    let summary = recorder.summary();
    tracing::info!(
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.errors,
        crashed = summary.crashed,
        skipped = summary.skipped,
        elapsed = ?test_duration,
        "Run complete"
    );

    Ok(RunOutcome {
        info: RunInfo {
            started,
            boot_duration,
            test_duration,
            target,
        },
        recorder,
    })
}
