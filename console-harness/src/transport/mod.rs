//! Byte channels to the target.
//!
//! Everything above this module sees the target through [`TransportChannel`]
//! only: bytes go in with `send`, bytes come out of `try_read`. The two
//! concrete channels are a TCP socket proxying the emulator's serial port and
//! a key injector paired with a tail over the serial log file.

use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;

pub mod keys;
pub mod log_tail;
pub mod scripted;
pub mod tcp;

pub use keys::{Key, KeyInjector, QemuMonitor, SpecialKey, VBoxManage};
pub use log_tail::{InjectedConsole, LogTail};
pub use scripted::{Reply, ScriptedTransport};
pub use tcp::TcpSerial;

/// Read size used by the session for each poll.
pub const READ_CHUNK: usize = 4096;

#[allow(async_fn_in_trait)]
pub trait TransportChannel {
    /// Deliver `bytes` to the target. No framing is added.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Return whatever is available, waiting at most `wait` for the first
    /// byte. An empty vector means nothing arrived; it is not an error.
    async fn try_read(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Short human-readable description for logs and reports.
    fn describe(&self) -> String;
}

/// Retries `connect` with linearly growing spacing (capped at one second)
/// until it succeeds or `attempts` are used up.
pub async fn connect_with_retry<T, F, Fut>(
    addr: &str,
    attempts: u32,
    spacing: Duration,
    mut connect: F,
) -> Result<T, TransportError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match connect(addr.to_string()).await {
            Ok(conn) => {
                tracing::info!(addr, attempt, "Connected");
                return Ok(conn);
            }
            Err(e) => {
                tracing::debug!(addr, attempt, error = %e, "Connection attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff(spacing, attempt)).await;
        }
    }
    Err(TransportError::Refused {
        addr: addr.to_string(),
        attempts,
        source: last_error.unwrap_or_else(|| std::io::Error::other("no connection attempt made")),
    })
}

fn backoff(spacing: Duration, attempt: u32) -> Duration {
    spacing.saturating_mul(attempt).min(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_backoff_grows_and_caps() {
        let spacing = Duration::from_millis(250);
        assert_eq!(backoff(spacing, 1), Duration::from_millis(250));
        assert_eq!(backoff(spacing, 3), Duration::from_millis(750));
        assert_eq!(backoff(spacing, 9), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_refusals() {
        let mut calls = 0;
        let conn = connect_with_retry("127.0.0.1:1", 10, Duration::from_millis(100), |_| {
            calls += 1;
            let n = calls;
            async move {
                if n < 4 {
                    Err(std::io::Error::from(ErrorKind::ConnectionRefused))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(conn, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let start = tokio::time::Instant::now();
        let err = connect_with_retry("127.0.0.1:1", 3, Duration::from_millis(100), |_| async {
            Err::<(), _>(std::io::Error::from(ErrorKind::ConnectionRefused))
        })
        .await
        .unwrap_err();
        match err {
            TransportError::Refused { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        // 100ms + 200ms between the three attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
