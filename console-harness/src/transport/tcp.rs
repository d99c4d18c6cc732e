use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{connect_with_retry, TransportChannel};
use crate::error::TransportError;

/// Serial port exposed by the emulator as a TCP server
/// (`-serial tcp:HOST:PORT,server,nowait`).
pub struct TcpSerial {
    stream: TcpStream,
    addr: String,
}

impl TcpSerial {
    pub async fn connect(
        addr: &str,
        attempts: u32,
        spacing: Duration,
    ) -> Result<Self, TransportError> {
        let stream =
            connect_with_retry(addr, attempts, spacing, |a: String| TcpStream::connect(a)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            addr: addr.to_string(),
        })
    }
}

impl TransportChannel for TcpSerial {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        tracing::trace!(bytes = ?String::from_utf8_lossy(bytes), "serial tx");
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn try_read(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_bytes.max(1)];
        match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => {
                buf.truncate(n);
                tracing::trace!(bytes = ?String::from_utf8_lossy(&buf), "serial rx");
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("tcp serial {}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_and_partial_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let target = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut line = [0u8; 5];
            sock.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"ping\r");
            sock.write_all(b"po").await.unwrap();
            sock.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            sock.write_all(b"ng\r\n").await.unwrap();
        });

        let mut serial = TcpSerial::connect(&addr, 5, Duration::from_millis(10)).await.unwrap();
        serial.send(b"ping\r").await.unwrap();

        let mut got = Vec::new();
        while got.len() < 6 {
            got.extend(serial.try_read(64, Duration::from_millis(500)).await.unwrap());
        }
        assert_eq!(got, b"pong\r\n");
        target.await.unwrap();

        // peer is gone now
        let mut closed = false;
        for _ in 0..10 {
            match serial.try_read(64, Duration::from_millis(100)).await {
                Err(TransportError::Closed) => {
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn test_try_read_returns_empty_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _target = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut serial = TcpSerial::connect(&addr, 5, Duration::from_millis(10)).await.unwrap();
        let got = serial.try_read(64, Duration::from_millis(30)).await.unwrap();
        assert!(got.is_empty());
    }
}
