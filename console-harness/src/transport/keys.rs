//! Keyboard injection for targets whose console is only reachable as a
//! virtual keyboard.
//!
//! Commands travel through the harness as bytes. Printable ASCII is typed as
//! text, CR/LF become Enter, and the reserved range `0xF0..=0xF8` carries the
//! non-printable keys (arrows, Home/End, Delete, PageUp/PageDown) the target's
//! serial driver also understands.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;

use super::connect_with_retry;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    Delete,
    PageUp,
    PageDown,
}

impl SpecialKey {
    pub const ALL: [SpecialKey; 9] = [
        SpecialKey::Up,
        SpecialKey::Down,
        SpecialKey::Left,
        SpecialKey::Right,
        SpecialKey::Home,
        SpecialKey::End,
        SpecialKey::Delete,
        SpecialKey::PageUp,
        SpecialKey::PageDown,
    ];

    pub const FIRST_MARKER: u8 = 0xF0;

    pub fn from_marker(byte: u8) -> Option<Self> {
        byte.checked_sub(Self::FIRST_MARKER)
            .and_then(|i| Self::ALL.get(i as usize))
            .copied()
    }

    pub fn marker(self) -> u8 {
        Self::FIRST_MARKER + self as u8
    }

    /// Name used inside `{...}` tokens in suite files.
    pub fn token(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Home => "HOME",
            Self::End => "END",
            Self::Delete => "DELETE",
            Self::PageUp => "PGUP",
            Self::PageDown => "PGDOWN",
        }
    }

    fn qemu_name(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
            Self::Home => "home",
            Self::End => "end",
            Self::Delete => "delete",
            Self::PageUp => "pgup",
            Self::PageDown => "pgdn",
        }
    }

    /// Set-1 make/break codes, all extended (E0-prefixed).
    fn scancodes(self) -> [u8; 4] {
        let make = match self {
            Self::Up => 0x48,
            Self::Down => 0x50,
            Self::Left => 0x4B,
            Self::Right => 0x4D,
            Self::Home => 0x47,
            Self::End => 0x4F,
            Self::Delete => 0x53,
            Self::PageUp => 0x49,
            Self::PageDown => 0x51,
        };
        [0xE0, make, 0xE0, make | 0x80]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Text(String),
    Enter,
    Special(SpecialKey),
}

/// Splits a byte command into typed text runs and discrete keys.
pub fn decode(bytes: &[u8]) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut text = String::new();
    let mut iter = bytes.iter().copied().peekable();

    let flush = |text: &mut String, keys: &mut Vec<Key>| {
        if !text.is_empty() {
            keys.push(Key::Text(std::mem::take(text)));
        }
    };

    while let Some(byte) = iter.next() {
        match byte {
            b'\r' | b'\n' => {
                flush(&mut text, &mut keys);
                if byte == b'\r' && iter.peek() == Some(&b'\n') {
                    iter.next();
                }
                keys.push(Key::Enter);
            }
            b'\t' | 0x20..=0x7E => text.push(byte as char),
            _ => match SpecialKey::from_marker(byte) {
                Some(key) => {
                    flush(&mut text, &mut keys);
                    keys.push(Key::Special(key));
                }
                None => tracing::debug!(byte, "dropping untypeable byte"),
            },
        }
    }
    flush(&mut text, &mut keys);
    keys
}

/// Replaces `{UP}`, `{DOWN}`, ... tokens with their marker bytes.
/// Braces that do not form a known token are kept literally.
pub fn expand_tokens(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len());
    let mut rest = command;
    while let Some(open) = rest.find('{') {
        out.extend_from_slice(rest[..open].as_bytes());
        let after = &rest[open + 1..];
        let special = after.find('}').and_then(|close| {
            let name = &after[..close];
            SpecialKey::ALL
                .iter()
                .find(|k| k.token() == name)
                .map(|k| (k.marker(), close))
        });
        match special {
            Some((marker, close)) => {
                out.push(marker);
                rest = &after[close + 1..];
            }
            None => {
                out.push(b'{');
                rest = after;
            }
        }
    }
    out.extend_from_slice(rest.as_bytes());
    out
}

/// Side channel that presses keys on the target.
#[allow(async_fn_in_trait)]
pub trait KeyInjector {
    async fn inject(&mut self, keys: &[Key]) -> Result<(), TransportError>;

    fn describe(&self) -> String;
}

/// QEMU human monitor over TCP (`-monitor tcp:HOST:PORT,server,nowait`).
pub struct QemuMonitor {
    stream: TcpStream,
    addr: String,
}

impl QemuMonitor {
    pub async fn connect(
        addr: &str,
        attempts: u32,
        spacing: Duration,
    ) -> Result<Self, TransportError> {
        let stream =
            connect_with_retry(addr, attempts, spacing, |a: String| TcpStream::connect(a)).await?;
        Ok(Self {
            stream,
            addr: addr.to_string(),
        })
    }

    /// Monitor key names for one typed key, e.g. `shift-a` for `A`.
    pub fn key_names(key: &Key) -> Result<Vec<String>, TransportError> {
        match key {
            Key::Enter => Ok(vec!["ret".to_string()]),
            Key::Special(special) => Ok(vec![special.qemu_name().to_string()]),
            Key::Text(text) => text.chars().map(qemu_char).collect(),
        }
    }

    /// The monitor echoes every command; keep its socket buffer empty.
    async fn discard_chatter(&mut self) -> Result<(), TransportError> {
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(Duration::from_millis(5), self.stream.read(&mut buf)).await {
                Err(_) => return Ok(()),
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn qemu_char(c: char) -> Result<String, TransportError> {
    let name = match c {
        'a'..='z' | '0'..='9' => c.to_string(),
        'A'..='Z' => format!("shift-{}", c.to_ascii_lowercase()),
        ' ' => "spc".into(),
        '\t' => "tab".into(),
        '-' => "minus".into(),
        '=' => "equal".into(),
        '.' => "dot".into(),
        ',' => "comma".into(),
        '/' => "slash".into(),
        ';' => "semicolon".into(),
        '\'' => "apostrophe".into(),
        '[' => "bracket_left".into(),
        ']' => "bracket_right".into(),
        '\\' => "backslash".into(),
        '`' => "grave_accent".into(),
        _ => {
            let base = match c {
                '_' => "minus",
                '+' => "equal",
                '>' => "dot",
                '<' => "comma",
                '?' => "slash",
                ':' => "semicolon",
                '"' => "apostrophe",
                '{' => "bracket_left",
                '}' => "bracket_right",
                '|' => "backslash",
                '~' => "grave_accent",
                '!' => "1",
                '@' => "2",
                '#' => "3",
                '$' => "4",
                '%' => "5",
                '^' => "6",
                '&' => "7",
                '*' => "8",
                '(' => "9",
                ')' => "0",
                _ => return Err(TransportError::Injector(format!("no key for {c:?}"))),
            };
            format!("shift-{base}")
        }
    };
    Ok(name)
}

impl KeyInjector for QemuMonitor {
    async fn inject(&mut self, keys: &[Key]) -> Result<(), TransportError> {
        let mut script = String::new();
        for key in keys {
            for name in Self::key_names(key)? {
                script.push_str("sendkey ");
                script.push_str(&name);
                script.push('\n');
            }
        }
        self.stream.write_all(script.as_bytes()).await?;
        self.stream.flush().await?;
        self.discard_chatter().await
    }

    fn describe(&self) -> String {
        format!("qemu monitor {}", self.addr)
    }
}

/// VirtualBox `controlvm` keyboard commands.
pub struct VBoxManage {
    program: PathBuf,
    vm: String,
}

impl VBoxManage {
    pub fn locate(vm: &str) -> Result<Self, TransportError> {
        let program = which::which("VBoxManage")
            .map_err(|e| TransportError::Injector(format!("VBoxManage not found: {e}")))?;
        Ok(Self {
            program,
            vm: vm.to_string(),
        })
    }

    /// `controlvm` argument lists, one per invocation.
    pub fn invocations(&self, keys: &[Key]) -> Vec<Vec<String>> {
        keys.iter()
            .map(|key| {
                let mut args = vec!["controlvm".to_string(), self.vm.clone()];
                match key {
                    Key::Text(text) => {
                        args.push("keyboardputstring".into());
                        args.push(text.clone());
                    }
                    Key::Enter => {
                        args.push("keyboardputscancode".into());
                        args.extend(["1c".to_string(), "9c".to_string()]);
                    }
                    Key::Special(special) => {
                        args.push("keyboardputscancode".into());
                        args.extend(special.scancodes().iter().map(|b| format!("{b:02x}")));
                    }
                }
                args
            })
            .collect()
    }
}

impl KeyInjector for VBoxManage {
    async fn inject(&mut self, keys: &[Key]) -> Result<(), TransportError> {
        for args in self.invocations(keys) {
            let output = Command::new(&self.program).args(&args).output().await?;
            if !output.status.success() {
                return Err(TransportError::Injector(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("VBoxManage keyboard on {}", self.vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_range_maps_in_order() {
        assert_eq!(SpecialKey::from_marker(0xF0), Some(SpecialKey::Up));
        assert_eq!(SpecialKey::from_marker(0xF8), Some(SpecialKey::PageDown));
        assert_eq!(SpecialKey::from_marker(0xF9), None);
        assert_eq!(SpecialKey::from_marker(0x0D), None);
        for key in SpecialKey::ALL {
            assert_eq!(SpecialKey::from_marker(key.marker()), Some(key));
        }
    }

    #[test]
    fn test_decode_splits_text_enter_and_specials() {
        let keys = decode(b"ls -l\xF0\xF0\r\n");
        assert_eq!(
            keys,
            vec![
                Key::Text("ls -l".into()),
                Key::Special(SpecialKey::Up),
                Key::Special(SpecialKey::Up),
                Key::Enter,
            ]
        );
    }

    #[test]
    fn test_decode_drops_untypeable_bytes() {
        assert_eq!(decode(b"a\x07b\r"), vec![Key::Text("ab".into()), Key::Enter]);
    }

    #[test]
    fn test_expand_tokens() {
        assert_eq!(expand_tokens("snake{UP}{LEFT}"), b"snake\xF0\xF2".to_vec());
        assert_eq!(expand_tokens("echo {x} {PGDOWN"), b"echo {x} {PGDOWN".to_vec());
        assert_eq!(expand_tokens("{}{END}"), b"{}\xF5".to_vec());
    }

    #[test]
    fn test_qemu_key_names() {
        let names = QemuMonitor::key_names(&Key::Text("Ab_1 ".into())).unwrap();
        assert_eq!(names, vec!["shift-a", "b", "shift-minus", "1", "spc"]);
        assert_eq!(QemuMonitor::key_names(&Key::Enter).unwrap(), vec!["ret"]);
        assert_eq!(
            QemuMonitor::key_names(&Key::Special(SpecialKey::PageDown)).unwrap(),
            vec!["pgdn"]
        );
        assert!(QemuMonitor::key_names(&Key::Text("é".into())).is_err());
    }

    #[test]
    fn test_vbox_invocations() {
        let vbox = VBoxManage {
            program: PathBuf::from("VBoxManage"),
            vm: "TrustOS".into(),
        };
        let calls =
            vbox.invocations(&[Key::Text("help".into()), Key::Special(SpecialKey::Up), Key::Enter]);
        assert_eq!(calls[0], ["controlvm", "TrustOS", "keyboardputstring", "help"]);
        assert_eq!(
            calls[1],
            ["controlvm", "TrustOS", "keyboardputscancode", "e0", "48", "e0", "c8"]
        );
        assert_eq!(calls[2], ["controlvm", "TrustOS", "keyboardputscancode", "1c", "9c"]);
    }

    #[tokio::test]
    async fn test_qemu_monitor_sends_sendkey_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let monitor = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"QEMU monitor\r\n(qemu) ").await.unwrap();
            let mut got = Vec::new();
            let mut buf = [0u8; 256];
            while !got.ends_with(b"sendkey ret\n") {
                let n = sock.read(&mut buf).await.unwrap();
                got.extend_from_slice(&buf[..n]);
            }
            got
        });

        let mut injector = QemuMonitor::connect(&addr, 5, Duration::from_millis(10)).await.unwrap();
        injector.inject(&decode(b"ls\r")).await.unwrap();
        let got = monitor.await.unwrap();
        assert_eq!(got, b"sendkey l\nsendkey s\nsendkey ret\n");
    }
}
