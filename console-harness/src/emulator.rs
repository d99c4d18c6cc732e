//! Launching the target under QEMU and asking whether it is still running.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{HarnessError, HarnessResult};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

const QEMU_ARGS: &[&str] = &["-display", "none", "-no-reboot"];

/// Where the guest's first serial port goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialRedirect {
    /// QEMU listens on this port; the harness connects to it.
    Tcp { port: u16 },
    /// Serial output appended to `path`; keys go in through the monitor.
    File { path: PathBuf, monitor_port: u16 },
}

#[derive(Debug, Clone)]
pub struct EmulatorSpec {
    pub media: PathBuf,
    pub memory_mb: u32,
    pub serial: SerialRedirect,
}

impl EmulatorSpec {
    pub fn new(media: impl Into<PathBuf>, serial: SerialRedirect) -> Self {
        Self {
            media: media.into(),
            memory_mb: 512,
            serial,
        }
    }

    pub fn qemu_args(&self) -> Vec<String> {
        let mut args = vec![
            "-cdrom".to_string(),
            self.media.display().to_string(),
            "-m".to_string(),
            self.memory_mb.to_string(),
        ];
        match &self.serial {
            SerialRedirect::Tcp { port } => {
                args.push("-serial".into());
                args.push(format!("tcp:127.0.0.1:{port},server,nowait"));
            }
            SerialRedirect::File { path, monitor_port } => {
                args.push("-serial".into());
                args.push(format!("file:{}", path.display()));
                args.push("-monitor".into());
                args.push(format!("tcp:127.0.0.1:{monitor_port},server,nowait"));
            }
        }
        args.extend(QEMU_ARGS.iter().map(|a| a.to_string()));
        args
    }
}

/// Anything that can say whether the target is still up.
pub trait Liveness {
    fn is_alive(&mut self) -> bool;
}

/// Used when attaching to a target the harness did not start.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAlive;

impl Liveness for AlwaysAlive {
    fn is_alive(&mut self) -> bool {
        true
    }
}

/// A QEMU process owned by the harness. Killed when dropped.
#[derive(Debug)]
pub struct Emulator {
    child: Child,
}

impl Emulator {
    pub fn launch(spec: &EmulatorSpec) -> HarnessResult<Self> {
        if !spec.media.is_file() {
            return Err(HarnessError::Emulator(format!(
                "media not found: {}",
                spec.media.display()
            )));
        }
        let qemu = which::which(QEMU_BINARY)
            .map_err(|e| HarnessError::Emulator(format!("{QEMU_BINARY}: {e}")))?;
        Self::spawn(&qemu, &spec.qemu_args())
    }

    fn spawn(program: &Path, args: &[String]) -> HarnessResult<Self> {
        tracing::info!(program = %program.display(), args = ?args, "Launching emulator");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::Emulator(format!("{}: {e}", program.display())))?;
        Ok(Self { child })
    }

    pub async fn shutdown(mut self) -> HarnessResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::info!(%status, "Emulator already exited");
            return Ok(());
        }
        self.child.kill().await?;
        tracing::info!("Emulator stopped");
        Ok(())
    }
}

impl Liveness for Emulator {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(%status, "Emulator exited");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not query emulator state");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_serial_args() {
        let spec = EmulatorSpec::new("trustos.iso", SerialRedirect::Tcp { port: 5555 });
        let args = spec.qemu_args();
        assert_eq!(&args[..4], ["-cdrom", "trustos.iso", "-m", "512"]);
        let serial = args.iter().position(|a| a == "-serial").unwrap();
        assert_eq!(args[serial + 1], "tcp:127.0.0.1:5555,server,nowait");
        assert!(!args.contains(&"-monitor".to_string()));
        assert_eq!(&args[args.len() - 3..], ["-display", "none", "-no-reboot"]);
    }

    #[test]
    fn test_file_serial_args_add_monitor() {
        let spec = EmulatorSpec::new(
            "os.iso",
            SerialRedirect::File {
                path: "serial.log".into(),
                monitor_port: 5556,
            },
        );
        let args = spec.qemu_args().join(" ");
        assert!(args.contains("-serial file:serial.log"));
        assert!(args.contains("-monitor tcp:127.0.0.1:5556,server,nowait"));
    }

    #[test]
    fn test_missing_media_is_an_error() {
        let spec = EmulatorSpec::new("/nonexistent/os.iso", SerialRedirect::Tcp { port: 1 });
        assert!(matches!(Emulator::launch(&spec), Err(HarnessError::Emulator(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_liveness_follows_process() {
        let sh = which::which("sh").unwrap();
        let mut emu = Emulator::spawn(&sh, &["-c".into(), "exit 0".into()]).unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while emu.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!emu.is_alive());
        emu.shutdown().await.unwrap();
    }
}
