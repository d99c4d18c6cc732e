use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::keys::{self, KeyInjector};
use super::TransportChannel;
use crate::error::TransportError;

/// Incremental reader over a growing, append-only log file.
///
/// The cursor only moves forward: bytes are handed out exactly once, so
/// nothing downstream ever sees (or scans) the same output twice.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    shrink_reported: bool,
}

impl LogTail {
    /// Tail from the beginning of the file (which may not exist yet).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            shrink_reported: false,
        }
    }

    /// Tail only what is appended from now on. Used when attaching to a
    /// target whose log already holds a previous run.
    pub async fn from_end(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let offset = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            offset,
            shrink_reported: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads up to `max_bytes` appended since the last call.
    pub async fn read_new(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            if !self.shrink_reported {
                tracing::warn!(
                    path = %self.path.display(),
                    len,
                    offset = self.offset,
                    "Log file shrank; waiting for it to grow past the cursor"
                );
                self.shrink_reported = true;
            }
            return Ok(Vec::new());
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(((len - self.offset) as usize).min(max_bytes));
        file.take(max_bytes as u64).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;
        Ok(buf)
    }
}

/// Console driven through a keyboard side channel and observed through the
/// serial log file.
pub struct InjectedConsole<K> {
    injector: K,
    tail: LogTail,
}

impl<K: KeyInjector> InjectedConsole<K> {
    pub fn new(injector: K, tail: LogTail) -> Self {
        Self { injector, tail }
    }

    pub fn offset(&self) -> u64 {
        self.tail.offset()
    }
}

impl<K: KeyInjector> TransportChannel for InjectedConsole<K> {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let keys = keys::decode(bytes);
        tracing::trace!(?keys, "inject");
        self.injector.inject(&keys).await
    }

    async fn try_read(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let chunk = self.tail.read_new(max_bytes).await?;
        if !chunk.is_empty() || wait.is_zero() {
            return Ok(chunk);
        }
        tokio::time::sleep(wait).await;
        Ok(self.tail.read_new(max_bytes).await?)
    }

    fn describe(&self) -> String {
        format!("{} + tail {}", self.injector.describe(), self.tail.path().display())
    }
}
