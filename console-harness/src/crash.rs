//! Fault detection over the raw stream.
//!
//! The scanner sees every byte the transport delivers, whichever command is
//! in flight. It keeps a short tail of the previous chunk so a signature split
//! across two reads is still found, and only reports matches that end in the
//! new bytes: the same bytes never raise twice.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::error::{HarnessError, HarnessResult};

/// Characters of context kept after the matched signature.
const EXCERPT_LEN: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashEvent {
    /// Test or phase active when the signature arrived.
    pub context: String,
    pub signature: String,
    pub excerpt: String,
}

#[derive(Debug)]
pub struct CrashScanner {
    matcher: Regex,
    carry: String,
    carry_chars: usize,
    raised: HashSet<String>,
}

impl CrashScanner {
    pub fn new<S: AsRef<str>>(signatures: &[S]) -> HarnessResult<Self> {
        if signatures.is_empty() {
            return Err(HarnessError::Config("at least one crash signature is required".into()));
        }
        let alternation = signatures
            .iter()
            .map(|s| regex::escape(s.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = Regex::new(&alternation).map_err(|e| HarnessError::pattern(&alternation, e))?;
        let longest = signatures.iter().map(|s| s.as_ref().chars().count()).max().unwrap_or(1);
        Ok(Self {
            matcher,
            carry: String::new(),
            carry_chars: longest.saturating_sub(1),
            raised: HashSet::new(),
        })
    }

    /// Scans one chunk. At most one event is raised per context; later
    /// signatures in the same context are logged only.
    pub fn scan(&mut self, chunk: &[u8], context: &str) -> Option<CrashEvent> {
        if chunk.is_empty() {
            return None;
        }
        let mut text = std::mem::take(&mut self.carry);
        let fresh_from = text.len();
        text.push_str(&String::from_utf8_lossy(chunk));

        let event = self
            .matcher
            .find_iter(&text)
            .find(|m| m.end() > fresh_from)
            .and_then(|m| {
                let signature = m.as_str().to_string();
                if !self.raised.insert(context.to_string()) {
                    tracing::debug!(context, %signature, "further crash signature in same context");
                    return None;
                }
                Some(CrashEvent {
                    context: context.to_string(),
                    excerpt: excerpt(&text, m.start(), m.end()),
                    signature,
                })
            });

        self.carry = tail_chars(&text, self.carry_chars).to_string();
        event
    }
}

/// The line holding the match, plus a little of what follows it.
fn excerpt(text: &str, start: usize, end: usize) -> String {
    let line_start = text[..start].rfind('\n').map_or(0, |i| i + 1);
    let after: String = text[end..].chars().take(EXCERPT_LEN).collect();
    let raw = format!("{}{}", &text[line_start..end], after);
    crate::normalize::clean_text(&raw)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CRASH_SIGNATURES;

    fn scanner() -> CrashScanner {
        CrashScanner::new(DEFAULT_CRASH_SIGNATURES).unwrap()
    }

    #[test]
    fn test_detects_signature_with_context() {
        let mut s = scanner();
        assert!(s.scan(b"score: 10\r\n", "Snake: WASD").is_none());
        let event = s
            .scan(b"EXCEPTION: PAGE FAULT\r\nAccessed Address: 0x0\r\n", "Snake: WASD")
            .unwrap();
        assert_eq!(event.context, "Snake: WASD");
        assert_eq!(event.signature, "PAGE FAULT");
        assert!(event.excerpt.starts_with("EXCEPTION: PAGE FAULT"));
        assert!(event.excerpt.contains("Accessed Address: 0x0"));
    }

    #[test]
    fn test_signature_split_across_chunks() {
        let mut s = scanner();
        assert!(s.scan(b"\r\n!!! KERNEL PA", "boot").is_none());
        let event = s.scan(b"NIC !!!\r\n", "boot").unwrap();
        assert_eq!(event.signature, "KERNEL PANIC");
        assert_eq!(event.excerpt, "!!! KERNEL PANIC !!!");
    }

    #[test]
    fn test_carried_bytes_never_raise_twice() {
        let mut s = scanner();
        assert!(s.scan(b"DOUBLE FAULT", "FS: ls").is_some());
        // the signature is still inside the carried tail for the next context
        assert!(s.scan(b" more", "FS: pwd").is_none());
        assert!(s.scan(b"\r\nok\r\n", "FS: pwd").is_none());
    }

    #[test]
    fn test_one_event_per_context() {
        let mut s = scanner();
        assert!(s.scan(b"PAGE FAULT\r\n", "NET: ping").is_some());
        assert!(s.scan(b"DOUBLE FAULT\r\n", "NET: ping").is_none());
        assert!(s.scan(b"DOUBLE FAULT\r\n", "NET: ifconfig").is_some());
    }

    #[test]
    fn test_quiet_output_raises_nothing() {
        let mut s = scanner();
        for chunk in [&b"total 3\r\n"[..], b"drwx bin\r\n", b"[12:00:01] trustos:/$ "] {
            assert!(s.scan(chunk, "FS: ls").is_none());
        }
    }

    #[test]
    fn test_breakpoint_trap_is_not_a_crash() {
        let mut s = scanner();
        let trap = b"[      90][CPU0][WARN ] EXCEPTION: BREAKPOINT\r\nInterruptStackFrame {\r\n";
        assert!(s.scan(trap, "Debug: int3").is_none());
        let fatal = s.scan(b"EXCEPTION: INVALID OPCODE\r\n", "Debug: ud2").unwrap();
        assert_eq!(fatal.signature, "EXCEPTION: INVALID OPCODE");
    }

    #[test]
    fn test_custom_signatures_are_literal() {
        let mut s = CrashScanner::new(&["BUG (x)"][..]).unwrap();
        assert!(s.scan(b"BUG x", "t").is_none());
        assert!(s.scan(b"BUG (x)", "t").is_some());
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("abc", 0), "");
    }
}
