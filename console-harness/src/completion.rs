//! Deciding when a command's output is complete.
//!
//! The target never marks the end of a command. The default detector waits
//! for the shell prompt to reappear at the end of the buffer, looking past
//! kernel log lines that land after it; commands that announce their own end
//! with a banner use an explicit pattern instead.
//! Neither requires any output before the end marker, so commands that print
//! nothing still complete.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::config::Timings;
use crate::error::{HarnessError, HarnessResult};
use crate::normalize::NoiseFilter;

/// How much of the buffer's tail is inspected for a prompt.
const PROMPT_TAIL: usize = 512;

/// Bytes re-inspected on each call by [`PatternDetector`] so a banner split
/// across reads still matches.
const PATTERN_OVERLAP: usize = 256;

/// The shell prompt, compiled for the places it is looked for.
#[derive(Debug)]
pub struct PromptPattern {
    anywhere: Regex,
    at_end: Regex,
    at_line_start: Regex,
}

impl PromptPattern {
    pub fn new(body: &str) -> HarnessResult<Self> {
        let compile = |re: &str| Regex::new(re).map_err(|e| HarnessError::pattern(body, e));
        Ok(Self {
            anywhere: compile(body)?,
            at_end: compile(&format!(r"(?:{body})\s*\z"))?,
            at_line_start: compile(&format!(r"\A(?:{body}) ?"))?,
        })
    }

    /// True when `text` ends with a prompt, ignoring trailing whitespace.
    pub fn ends(&self, text: &str) -> bool {
        self.at_end.is_match(text)
    }

    /// True when the last prompt on `line` is followed by nothing, or only by
    /// a log message that `noise` recognizes.
    pub fn closes_line(&self, line: &str, noise: &NoiseFilter) -> bool {
        let Some(prompt) = self.anywhere.find_iter(line).last() else {
            return false;
        };
        let rest = line[prompt.end()..].trim();
        rest.is_empty() || noise.is_noise(rest)
    }

    /// Removes every prompt that prefixes `line`.
    pub fn strip_leading<'a>(&self, mut line: &'a str) -> &'a str {
        while let Some(m) = self.at_line_start.find(line) {
            line = &line[m.end()..];
        }
        line
    }
}

/// ANSI-free text of the last `limit` bytes of `buffer`.
fn clean_tail(buffer: &[u8], limit: usize) -> String {
    let start = buffer.len().saturating_sub(limit);
    let text = String::from_utf8_lossy(&buffer[start..]);
    strip_ansi_escapes::strip_str(text)
}

pub trait CompletionDetector: Send {
    /// Inspects everything received since the command was sent. `elapsed` is
    /// the time since the send.
    fn is_complete(&mut self, buffer: &[u8], elapsed: Duration) -> bool;

    fn name(&self) -> &'static str;
}

/// Complete once the buffer ends with the shell prompt. Log lines after the
/// prompt, on its own line or the next ones, do not hide it.
pub struct PromptDetector {
    prompt: Arc<PromptPattern>,
    noise: NoiseFilter,
    min_settle: Duration,
    min_bytes: usize,
}

impl PromptDetector {
    pub fn new(prompt: Arc<PromptPattern>, noise: NoiseFilter, timings: &Timings) -> Self {
        Self {
            prompt,
            noise,
            min_settle: timings.min_settle,
            min_bytes: timings.min_bytes,
        }
    }
}

impl CompletionDetector for PromptDetector {
    fn is_complete(&mut self, buffer: &[u8], elapsed: Duration) -> bool {
        // The echo of the command arrives first; don't judge before either
        // some time has passed or enough has arrived.
        if elapsed < self.min_settle && buffer.len() < self.min_bytes {
            return false;
        }
        let tail = clean_tail(buffer, PROMPT_TAIL);
        let last = tail
            .lines()
            .rev()
            .map(str::trim_end)
            .find(|line| !line.is_empty() && !self.noise.is_noise(line));
        last.is_some_and(|line| self.prompt.closes_line(line, &self.noise))
    }

    fn name(&self) -> &'static str {
        "prompt"
    }
}

/// Complete once `pattern` appears anywhere in the output. Prompts are
/// ignored entirely.
pub struct PatternDetector {
    pattern: Regex,
    searched: usize,
}

impl PatternDetector {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern, searched: 0 }
    }
}

impl CompletionDetector for PatternDetector {
    fn is_complete(&mut self, buffer: &[u8], _elapsed: Duration) -> bool {
        if buffer.len() < self.searched {
            self.searched = 0;
        }
        let start = self.searched.saturating_sub(PATTERN_OVERLAP);
        self.searched = buffer.len();
        self.pattern.is_match(&clean_tail(&buffer[start..], usize::MAX))
    }

    fn name(&self) -> &'static str {
        "pattern"
    }
}

/// Picks the detector for one command.
pub fn detector_for(
    completion: Option<&Regex>,
    prompt: &Arc<PromptPattern>,
    noise: &NoiseFilter,
    timings: &Timings,
) -> Box<dyn CompletionDetector> {
    match completion {
        Some(pattern) => Box::new(PatternDetector::new(pattern.clone())),
        None => Box::new(PromptDetector::new(Arc::clone(prompt), noise.clone(), timings)),
    }
}
