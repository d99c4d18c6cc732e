//! Turning a raw capture into the text a validator sees.
//!
//! Each stage is a line filter and the whole pipeline is idempotent:
//! normalizing already-normalized text returns it unchanged.

use std::sync::Arc;

use regex::Regex;

use crate::completion::PromptPattern;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

/// Denylist of asynchronous log lines. Lines that match nothing are kept.
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> HarnessResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()).map_err(|e| HarnessError::pattern(p.as_ref(), e)))
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_noise(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

#[derive(Debug, Clone)]
pub struct OutputNormalizer {
    noise: NoiseFilter,
    prompt: Arc<PromptPattern>,
}

impl OutputNormalizer {
    pub fn new(noise: NoiseFilter, prompt: Arc<PromptPattern>) -> Self {
        Self { noise, prompt }
    }

    pub fn from_config(config: &HarnessConfig, prompt: Arc<PromptPattern>) -> HarnessResult<Self> {
        Ok(Self::new(NoiseFilter::new(config.noise_patterns.as_slice())?, prompt))
    }

    pub fn noise(&self) -> &NoiseFilter {
        &self.noise
    }

    /// Isolates the output of `command` from a raw capture.
    pub fn normalize(&self, raw: &[u8], command: &str) -> String {
        let text = clean_text(&String::from_utf8_lossy(raw));

        let lines: Vec<&str> = text
            .split('\n')
            .map(|line| self.prompt.strip_leading(line).trim_end())
            .filter(|line| !self.noise.is_noise(line))
            .collect();

        // Terminal echo of the input. Every leading echo is dropped, not just
        // the first, so a second pass has nothing left to remove.
        let echo = collapse_whitespace(&visible_command(command));
        let mut start = 0;
        while start < lines.len() {
            let line = lines[start];
            if line.is_empty() || (!echo.is_empty() && collapse_whitespace(line) == echo) {
                start += 1;
            } else {
                break;
            }
        }

        let mut end = lines.len();
        while end > start && lines[end - 1].is_empty() {
            end -= 1;
        }

        lines[start..end].join("\n")
    }
}

/// Strips escape sequences and control bytes, unifying line endings to `\n`.
pub fn clean_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    strip_ansi_escapes::strip_str(unified)
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect()
}

/// The command as it would appear on screen: special-key tokens type nothing.
fn visible_command(command: &str) -> String {
    let bytes = crate::transport::keys::expand_tokens(command);
    String::from_utf8_lossy(&bytes)
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER && !c.is_control())
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_NOISE_PATTERNS, DEFAULT_PROMPT};
    use proptest::prelude::*;

    fn normalizer() -> OutputNormalizer {
        let prompt = Arc::new(PromptPattern::new(DEFAULT_PROMPT).unwrap());
        OutputNormalizer::new(NoiseFilter::new(DEFAULT_NOISE_PATTERNS).unwrap(), prompt)
    }

    #[test]
    fn test_isolates_echo_output() {
        let raw = b"echo hello_42\r\nhello_42\r\n[12:00:01] trustos:/$ ";
        assert_eq!(normalizer().normalize(raw, "echo hello_42"), "hello_42");
    }

    #[test]
    fn test_prompt_prefixed_echo_is_dropped() {
        let raw = b"[12:00:00] trustos:/$ pwd\r\n/home\r\n[12:00:01] trustos:/home$ ";
        assert_eq!(normalizer().normalize(raw, "pwd"), "/home");
    }

    #[test]
    fn test_strips_ansi_and_control_bytes() {
        let raw = b"ls\r\n\x1b[36mbin\x1b[0m  \x1b[1metc\x1b[0m\x07\r\n\
            \x1b[32m[12:00:01] trustos:/$ \x1b[0m";
        assert_eq!(normalizer().normalize(raw, "ls"), "bin  etc");
    }

    #[test]
    fn test_drops_known_noise_keeps_unknown() {
        let raw = b"free\r\n\
            [      4211][CPU0][DEBUG] timer rebased\r\n\
            Total: 512 MB\r\n\
            [xHCI] port 3 reset\r\n\
            (unknown chatter)\r\n\
            Free: 300 MB\r\n\
            [12:00:01] trustos:/$ ";
        assert_eq!(
            normalizer().normalize(raw, "free"),
            "Total: 512 MB\n(unknown chatter)\nFree: 300 MB"
        );
    }

    #[test]
    fn test_empty_output() {
        let cleared = b"clear\r\n\x1b[2J\x1b[H[00:00:07] trustos:/$ ";
        assert_eq!(normalizer().normalize(cleared, "clear"), "");
        assert_eq!(normalizer().normalize(b"", "clear"), "");
    }

    #[test]
    fn test_inner_blank_lines_survive() {
        let raw = b"cat notes\r\n\r\nfirst\r\n\r\nsecond\r\n\r\n";
        assert_eq!(normalizer().normalize(raw, "cat notes"), "first\n\nsecond");
    }

    #[test]
    fn test_echo_with_special_keys() {
        let raw = b"snake\r\nscore: 3\r\n";
        assert_eq!(normalizer().normalize(raw, "snake{UP}"), "score: 3");
    }

    #[test]
    fn test_echo_with_extra_spaces() {
        let raw = b"echo   a  b\r\na b\r\n";
        assert_eq!(normalizer().normalize(raw, "echo a b"), "a b");
    }

    #[test]
    fn test_custom_noise_set() {
        let prompt = Arc::new(PromptPattern::new(DEFAULT_PROMPT).unwrap());
        let n = OutputNormalizer::new(NoiseFilter::new(&["^DBG "][..]).unwrap(), prompt);
        assert_eq!(n.normalize(b"x\r\nDBG tick\r\n[ACPI] kept\r\n", "x"), "[ACPI] kept");
    }

    fn raw_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-zA-Z0-9 _./:-]{0,24}",
            Just("[12:00:01] trustos:/$ ".to_string()),
            Just("[      12][CPU0][INFO ] tick".to_string()),
            Just("[ACPI] table".to_string()),
            Just("\x1b[31mred\x1b[0m".to_string()),
            Just("echo hi".to_string()),
            Just("  \t ".to_string()),
        ]
    }

    fn raw_buffer() -> impl Strategy<Value = String> {
        (
            prop::collection::vec(raw_line(), 0..12),
            prop::collection::vec(prop_oneof![Just("\r\n"), Just("\n"), Just("\r")], 12),
        )
            .prop_map(|(lines, seps)| {
                lines
                    .iter()
                    .zip(seps.iter())
                    .map(|(l, s)| format!("{l}{s}"))
                    .collect::<String>()
            })
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(
            raw in raw_buffer(),
            cmd in prop_oneof![Just("echo hi"), Just("ls"), Just("")]
        ) {
            let n = normalizer();
            let once = n.normalize(raw.as_bytes(), cmd);
            let twice = n.normalize(once.as_bytes(), cmd);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_clean_text_is_idempotent(raw in raw_buffer()) {
            let once = clean_text(&raw);
            prop_assert_eq!(clean_text(&once), once.clone());
        }
    }
}
