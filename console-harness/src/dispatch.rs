//! Runs test cases one at a time against a booted target.
//!
//! Per case: drain stale output, send the command, collect until the
//! completion detector fires or a crash shows up (or the timeout passes),
//! then normalize, validate and record. Exactly one result is recorded per
//! case, in submission order.
//! Once the target is gone every remaining case is recorded as skipped.

use std::sync::Arc;
use std::time::Duration;

use crate::case::TestCase;
use crate::completion::{detector_for, PromptPattern};
use crate::config::{HarnessConfig, Timings};
use crate::emulator::Liveness;
use crate::error::HarnessResult;
use crate::normalize::OutputNormalizer;
use crate::record::{truncate_snippet, ResultRecorder, Status, TestResult};
use crate::session::{Completion, Session};
use crate::transport::TransportChannel;

pub struct Dispatcher {
    normalizer: OutputNormalizer,
    prompt: Arc<PromptPattern>,
    timings: Timings,
    snippet_len: usize,
}

impl Dispatcher {
    pub fn new(
        normalizer: OutputNormalizer,
        prompt: Arc<PromptPattern>,
        timings: Timings,
        snippet_len: usize,
    ) -> Self {
        Self {
            normalizer,
            prompt,
            timings,
            snippet_len,
        }
    }

    pub fn from_config(config: &HarnessConfig, prompt: Arc<PromptPattern>) -> HarnessResult<Self> {
        let normalizer = OutputNormalizer::from_config(config, Arc::clone(&prompt))?;
        Ok(Self::new(normalizer, prompt, config.timings, config.snippet_len))
    }

    pub async fn run<T: TransportChannel>(
        &self,
        session: &mut Session<T>,
        cases: &[TestCase],
        recorder: &mut ResultRecorder,
        liveness: &mut dyn Liveness,
    ) {
        // anything raised while booting
        for event in session.take_crashes() {
            recorder.record_crash(event);
        }

        let mut target_lost: Option<String> = None;
        for (idx, case) in cases.iter().enumerate() {
            if let Some(reason) = &target_lost {
                recorder.record(skipped(case, reason));
                continue;
            }

            let (result, lost) = self.run_case(session, case, recorder, liveness).await;
            log_result(&result);
            recorder.record(result);

            if let Some(reason) = lost {
                tracing::error!(
                    reason = %reason,
                    remaining = cases.len() - idx - 1,
                    "Target lost, skipping remaining tests"
                );
                target_lost = Some(reason);
            } else if idx + 1 < cases.len() {
                tokio::time::sleep(self.timings.inter_test_delay).await;
            }
        }
    }

    /// Returns the result and, if the target went away, why.
    async fn run_case<T: TransportChannel>(
        &self,
        session: &mut Session<T>,
        case: &TestCase,
        recorder: &mut ResultRecorder,
        liveness: &mut dyn Liveness,
    ) -> (TestResult, Option<String>) {
        let label = case.label();
        let timeout = case.timeout.unwrap_or(self.timings.command_timeout);
        let mut result = TestResult {
            category: case.category.clone(),
            name: case.name.clone(),
            command: case.command.clone(),
            status: Status::Error,
            output_snippet: String::new(),
            detail: None,
            timed_out: false,
            elapsed: Duration::ZERO,
        };

        let prepared = match session
            .drain(&label, self.timings.settle_window, self.timings.drain_ceiling)
            .await
        {
            Ok(_) => {
                tracing::info!(test = %label, command = %case.command, "Sending command");
                session.send(&case.wire_bytes()).await
            }
            Err(e) => Err(e),
        };
        let collected = match prepared {
            Ok(()) => {
                let mut detector = detector_for(
                    case.completion.as_ref(),
                    &self.prompt,
                    self.normalizer.noise(),
                    &self.timings,
                );
                tracing::debug!(
                    test = %label,
                    detector = detector.name(),
                    ?timeout,
                    "Collecting output"
                );
                Some(session.collect(&label, detector.as_mut(), timeout).await)
            }
            Err(e) => {
                result.detail = Some(format!("transport failed before the command completed: {e}"));
                None
            }
        };

        let mut lost = match &collected {
            None => result.detail.clone(),
            Some(c) => match &c.completion {
                Completion::Disconnected(reason) => Some(format!("transport lost: {reason}")),
                _ => None,
            },
        };
        if lost.is_none() && !liveness.is_alive() {
            lost = Some("target process exited".to_string());
        }

        let mut crash = None;
        for event in session.take_crashes() {
            if event.context == label && crash.is_none() {
                crash = Some(format!("crash signature `{}`: {}", event.signature, event.excerpt));
            }
            recorder.record_crash(event);
        }

        let Some(collected) = collected else {
            if let Some(detail) = crash {
                result.status = Status::Crash;
                result.detail = Some(detail);
            }
            return (result, lost);
        };

        let output = self.normalizer.normalize(&collected.bytes, &case.command);
        result.output_snippet = truncate_snippet(&output, self.snippet_len);
        result.elapsed = collected.elapsed;
        result.timed_out = collected.completion == Completion::TimedOut;

        (result.status, result.detail) = if let Some(detail) = crash {
            (Status::Crash, Some(detail))
        } else if let Some(reason) = &lost {
            (Status::Error, Some(reason.clone()))
        } else {
            match case.validator.check(&output) {
                Ok(_) if result.timed_out => {
                    (Status::Fail, Some(format!("no completion within {timeout:?}")))
                }
                Ok(true) => (Status::Pass, None),
                Ok(false) => (Status::Fail, Some("output did not satisfy the check".to_string())),
                Err(e) => (Status::Error, Some(e)),
            }
        };
        (result, lost)
    }
}

fn skipped(case: &TestCase, reason: &str) -> TestResult {
    TestResult {
        category: case.category.clone(),
        name: case.name.clone(),
        command: case.command.clone(),
        status: Status::Skip,
        output_snippet: String::new(),
        detail: Some(format!("not run: {reason}")),
        timed_out: false,
        elapsed: Duration::ZERO,
    }
}

fn log_result(result: &TestResult) {
    let test = result.label();
    match result.status {
        Status::Pass => tracing::info!(test = %test, elapsed = ?result.elapsed, "PASS"),
        status => tracing::warn!(
            test = %test,
            %status,
            timed_out = result.timed_out,
            detail = result.detail.as_deref().unwrap_or(""),
            "Test did not pass"
        ),
    }
}
