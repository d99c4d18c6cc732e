//! One connection to one booted target.
//!
//! The session owns the transport exclusively. Every byte read through it is
//! passed to the crash scanner exactly once, tagged with the caller's context,
//! before it is handed back.

use std::sync::Arc;
use std::time::Duration;

use crate::completion::{CompletionDetector, PromptPattern};
use crate::config::Timings;
use crate::crash::{CrashEvent, CrashScanner};
use crate::error::{HarnessError, HarnessResult, TransportError};
use crate::transport::{TransportChannel, READ_CHUNK};
use crate::wait::{Deadline, Quiet};

/// Context tag used for everything read before the first test.
pub const BOOT_CONTEXT: &str = "boot";

/// Bytes of boot output kept for prompt matching.
const BOOT_WINDOW: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Matched,
    TimedOut,
    /// A crash signature was seen under the collecting context.
    Crashed,
    /// The transport failed while collecting; the target is presumed gone.
    Disconnected(String),
}

#[derive(Debug)]
pub struct Collected {
    pub bytes: Vec<u8>,
    pub completion: Completion,
    pub elapsed: Duration,
}

pub struct Session<T> {
    transport: T,
    scanner: CrashScanner,
    prompt: Arc<PromptPattern>,
    timings: Timings,
    boot_confirmed: bool,
    crashes: Vec<CrashEvent>,
}

impl<T: TransportChannel> Session<T> {
    pub fn new(
        transport: T,
        scanner: CrashScanner,
        prompt: Arc<PromptPattern>,
        timings: Timings,
    ) -> Self {
        Self {
            transport,
            scanner,
            prompt,
            timings,
            boot_confirmed: false,
            crashes: Vec::new(),
        }
    }

    pub fn boot_confirmed(&self) -> bool {
        self.boot_confirmed
    }

    fn crashed(&self, context: &str) -> bool {
        self.crashes.iter().any(|e| e.context == context)
    }

    /// Crash events seen since the last call.
    pub fn take_crashes(&mut self) -> Vec<CrashEvent> {
        std::mem::take(&mut self.crashes)
    }

    /// One short-blocking read, scanned for crash signatures.
    pub async fn read_chunk(
        &mut self,
        context: &str,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let chunk = self.transport.try_read(READ_CHUNK, wait).await?;
        if !chunk.is_empty() {
            let rx = String::from_utf8_lossy(&chunk);
            tracing::trace!(context, rx = %rx.escape_debug(), "Serial read");
        }
        if let Some(event) = self.scanner.scan(&chunk, context) {
            tracing::warn!(
                context = %event.context,
                signature = %event.signature,
                excerpt = %event.excerpt,
                "Crash signature detected"
            );
            self.crashes.push(event);
        }
        Ok(chunk)
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        tracing::trace!(tx = %String::from_utf8_lossy(bytes).escape_debug(), "Serial write");
        self.transport.send(bytes).await
    }

    /// Reads until the stream has been quiet for `settle` or `ceiling` has
    /// passed, returning what was consumed.
    pub async fn drain(
        &mut self,
        context: &str,
        settle: Duration,
        ceiling: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Deadline::after(ceiling);
        let mut quiet = Quiet::new(settle);
        let mut drained = Vec::new();
        while !deadline.expired() && !quiet.settled() {
            let wait = deadline.clamp(quiet.remaining().min(self.timings.poll_interval));
            let chunk = self.read_chunk(context, wait).await?;
            if !chunk.is_empty() {
                quiet.touch();
                drained.extend_from_slice(&chunk);
            }
        }
        if !drained.is_empty() {
            tracing::debug!(context, bytes = drained.len(), "Drained stale output");
        }
        Ok(drained)
    }

    /// Accumulates output until `detector` fires, a crash signature shows up
    /// or `timeout` passes. Never fails: a timeout or a dead transport returns
    /// what has arrived so far.
    pub async fn collect(
        &mut self,
        context: &str,
        detector: &mut dyn CompletionDetector,
        timeout: Duration,
    ) -> Collected {
        let deadline = Deadline::after(timeout);
        let mut bytes = Vec::new();
        let mut last_checked = None;

        let mut completion = loop {
            // Re-evaluate when bytes arrive, and once more after the settle
            // gate opens for commands that produce very little.
            let settled = deadline.elapsed() >= self.timings.min_settle;
            if last_checked != Some((bytes.len(), settled)) {
                last_checked = Some((bytes.len(), settled));
                if detector.is_complete(&bytes, deadline.elapsed()) {
                    break Completion::Matched;
                }
            }
            if deadline.expired() {
                break Completion::TimedOut;
            }
            let wait = deadline.clamp(self.timings.poll_interval);
            match self.read_chunk(context, wait).await {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(e) => break Completion::Disconnected(e.to_string()),
            }
            // A halted kernel never prints another prompt.
            if self.crashed(context) {
                break Completion::Crashed;
            }
        };

        if matches!(completion, Completion::Matched | Completion::Crashed) {
            // The prompt can land a moment before trailing output, and a
            // crash banner spans several lines.
            let settle = self.timings.final_drain;
            match self.drain(context, settle, settle * 4).await {
                Ok(tail) => bytes.extend_from_slice(&tail),
                Err(e) if completion == Completion::Crashed => {
                    completion = Completion::Disconnected(e.to_string());
                }
                Err(e) => tracing::debug!(context, error = %e, "Final drain failed"),
            }
        }

        Collected {
            bytes,
            completion,
            elapsed: deadline.elapsed(),
        }
    }

    /// Waits for the first shell prompt. A bare carriage return is sent every
    /// `boot_nudge` in case the banner was printed before we connected.
    pub async fn wait_for_boot(&mut self, timeout: Duration) -> HarnessResult<Duration> {
        let deadline = Deadline::after(timeout);
        let mut window: Vec<u8> = Vec::new();
        let mut next_nudge = self.timings.boot_nudge;

        tracing::info!(
            transport = %self.transport.describe(),
            ?timeout,
            "Waiting for shell prompt"
        );
        while !deadline.expired() {
            let chunk = self
                .read_chunk(BOOT_CONTEXT, deadline.clamp(self.timings.poll_interval))
                .await
                .map_err(HarnessError::Connect)?;
            if !chunk.is_empty() {
                window.extend_from_slice(&chunk);
                if window.len() > BOOT_WINDOW {
                    window.drain(..window.len() - BOOT_WINDOW);
                }
                let text = strip_ansi_escapes::strip_str(String::from_utf8_lossy(&window));
                if self.prompt.ends(&text) {
                    self.boot_confirmed = true;
                    let elapsed = deadline.elapsed();
                    tracing::info!(elapsed = ?elapsed, "Shell prompt detected");
                    return Ok(elapsed);
                }
            }
            if !self.timings.boot_nudge.is_zero() && deadline.elapsed() >= next_nudge {
                next_nudge += self.timings.boot_nudge;
                tracing::debug!("Nudging console");
                self.send(b"\r").await.map_err(HarnessError::Connect)?;
            }
        }
        Err(HarnessError::BootTimeout(timeout))
    }
}
