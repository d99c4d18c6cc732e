//! In-memory target for exercising the harness without an emulator.
//!
//! Replies are scheduled relative to the moment the matching command line
//! arrives, on the tokio clock, so they compose with paused-time tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::TransportChannel;
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub enum Reply {
    /// Emit `bytes` this long after the command line was received.
    After(Duration, Vec<u8>),
    /// Hang up this long after the command line was received.
    CloseAfter(Duration),
}

impl Reply {
    pub fn after(delay: Duration, bytes: impl AsRef<[u8]>) -> Self {
        Self::After(delay, bytes.as_ref().to_vec())
    }

    pub fn now(bytes: impl AsRef<[u8]>) -> Self {
        Self::after(Duration::ZERO, bytes)
    }
}

#[derive(Debug)]
pub struct ScriptedTransport {
    scripts: Vec<(Vec<u8>, Vec<Reply>)>,
    pending: VecDeque<(Instant, Vec<u8>)>,
    close_at: Option<Instant>,
    echo: bool,
    line: Vec<u8>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            scripts: Vec::new(),
            pending: VecDeque::new(),
            close_at: None,
            echo: true,
            line: Vec::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Disable terminal echo of received lines.
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Replies for the next line equal to `command` (without terminator).
    /// Registering the same command twice answers successive sends in order.
    pub fn on(mut self, command: impl AsRef<[u8]>, replies: Vec<Reply>) -> Self {
        self.scripts.push((command.as_ref().to_vec(), replies));
        self
    }

    /// Output the target produces on its own, measured from now.
    pub fn unsolicited(mut self, delay: Duration, bytes: impl AsRef<[u8]>) -> Self {
        self.schedule(Instant::now() + delay, bytes.as_ref().to_vec());
        self
    }

    /// Handle for inspecting sent lines after the transport has been moved.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }

    fn schedule(&mut self, at: Instant, bytes: Vec<u8>) {
        let idx = self.pending.iter().position(|(t, _)| *t > at).unwrap_or(self.pending.len());
        self.pending.insert(idx, (at, bytes));
    }

    fn line_received(&mut self, line: Vec<u8>) {
        let now = Instant::now();
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(line.clone());
        }
        if self.echo {
            let mut echo = line.clone();
            echo.extend_from_slice(b"\r\n");
            self.schedule(now, echo);
        }
        let Some(idx) = self.scripts.iter().position(|(cmd, _)| *cmd == line) else {
            return;
        };
        let (_, replies) = self.scripts.remove(idx);
        for reply in replies {
            match reply {
                Reply::After(delay, bytes) => self.schedule(now + delay, bytes),
                Reply::CloseAfter(delay) => self.close_at = Some(now + delay),
            }
        }
    }

    fn take_due(&mut self, max_bytes: usize) -> Vec<u8> {
        let now = Instant::now();
        let mut out = Vec::new();
        while let Some((at, bytes)) = self.pending.front_mut() {
            if *at > now || out.len() >= max_bytes {
                break;
            }
            let room = max_bytes - out.len();
            if bytes.len() > room {
                out.extend(bytes.drain(..room));
                break;
            }
            out.append(bytes);
            self.pending.pop_front();
        }
        out
    }

    fn closed(&self) -> bool {
        self.close_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl TransportChannel for ScriptedTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed() {
            return Err(TransportError::Closed);
        }
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.line_received(line);
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    async fn try_read(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let chunk = self.take_due(max_bytes);
        if !chunk.is_empty() {
            return Ok(chunk);
        }
        if self.closed() {
            return Err(TransportError::Closed);
        }

        let mut wake = Instant::now() + wait;
        if let Some((at, _)) = self.pending.front() {
            wake = wake.min(*at);
        }
        if let Some(at) = self.close_at {
            wake = wake.min(at);
        }
        tokio::time::sleep_until(wake).await;

        let chunk = self.take_due(max_bytes);
        if chunk.is_empty() && self.closed() {
            return Err(TransportError::Closed);
        }
        Ok(chunk)
    }

    fn describe(&self) -> String {
        "scripted target".to_string()
    }
}
