//! Harness configuration.
//!
//! Every field has a default tuned for the target's serial shell, so an empty
//! JSON object (or no file at all) is a valid configuration. Durations are
//! written as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Default shell prompt: `[HH:MM:SS] host:/cwd$ `.
pub const DEFAULT_PROMPT: &str = r"\[\d{2}:\d{2}:\d{2}\] [\w.-]+:\S*[$#>]";

/// Asynchronous kernel log lines that may interleave with command output.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &[
    // [      1234][CPU0][INFO ] message
    r"^\[\s*\d+\]\[CPU\d+\]\[(TRACE|DEBUG|INFO|WARN|ERROR|FATAL)\s*\]",
    // [ACPI] ..., [xHCI] ..., [SDMA-TEST] ...
    r"^\[[A-Za-z][A-Za-z0-9_-]+\]\s",
];

/// Fatal banners only: a breakpoint trap logs `EXCEPTION: BREAKPOINT` and
/// carries on.
pub const DEFAULT_CRASH_SIGNATURES: &[&str] = &[
    "KERNEL PANIC",
    "panicked at",
    "EXCEPTION: INVALID OPCODE",
    "EXCEPTION: DIVIDE BY ZERO",
    "PAGE FAULT",
    "DOUBLE FAULT",
    "GENERAL PROTECTION FAULT",
    "assertion failed",
    "Unhandled exception",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub timings: Timings,
    /// Regex body of the shell prompt, unanchored.
    pub prompt: String,
    pub noise_patterns: Vec<String>,
    /// Literal markers; matched case-sensitively anywhere in the stream.
    pub crash_signatures: Vec<String>,
    /// Maximum characters of output kept per result for diagnostics.
    pub snippet_len: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            noise_patterns: DEFAULT_NOISE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            crash_signatures: DEFAULT_CRASH_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            snippet_len: 240,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = fs_err::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> HarnessResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.crash_signatures.iter().any(|s| s.is_empty()) {
            return Err(HarnessError::Config("crash signatures must not be empty".into()));
        }
        if self.timings.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Every wait in the harness is bounded by one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Upper bound on a single short-blocking read.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Quiet period that ends a drain.
    #[serde(with = "millis")]
    pub settle_window: Duration,
    /// Hard ceiling on a pre-command drain, even if bytes keep arriving.
    #[serde(with = "millis")]
    pub drain_ceiling: Duration,
    /// Prompt matching starts after this long since send...
    #[serde(with = "millis")]
    pub min_settle: Duration,
    /// ...or once this many bytes have arrived, whichever is first.
    pub min_bytes: usize,
    /// Quiet period read after a prompt match to pick up trailing bytes.
    #[serde(with = "millis")]
    pub final_drain: Duration,
    #[serde(with = "millis")]
    pub inter_test_delay: Duration,
    #[serde(with = "millis")]
    pub boot_timeout: Duration,
    /// While booting, a bare carriage return is sent this often to coax a prompt.
    #[serde(with = "millis")]
    pub boot_nudge: Duration,
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    pub connect_attempts: u32,
    /// Spacing of the first reconnect; grows linearly, capped at one second.
    #[serde(with = "millis")]
    pub connect_spacing: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            settle_window: Duration::from_millis(300),
            drain_ceiling: Duration::from_secs(3),
            min_settle: Duration::from_millis(150),
            min_bytes: 16,
            final_drain: Duration::from_millis(150),
            inter_test_delay: Duration::from_millis(200),
            boot_timeout: Duration::from_secs(120),
            boot_nudge: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            connect_attempts: 40,
            connect_spacing: Duration::from_millis(250),
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = HarnessConfig::from_json("{}").unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_partial_timings_keep_other_defaults() {
        let json = r#"{"timings": {"settle_window": 500, "min_bytes": 4}}"#;
        let config = HarnessConfig::from_json(json).unwrap();
        assert_eq!(config.timings.settle_window, Duration::from_millis(500));
        assert_eq!(config.timings.min_bytes, 4);
        assert_eq!(config.timings.drain_ceiling, Duration::from_secs(3));
        assert_eq!(config.prompt, DEFAULT_PROMPT);
    }

    #[test]
    fn test_noise_patterns_are_replaceable() {
        let config = HarnessConfig::from_json(r#"{"noise_patterns": ["^DBG "]}"#).unwrap();
        assert_eq!(config.noise_patterns, vec!["^DBG ".to_string()]);
    }

    #[test]
    fn test_rejects_empty_crash_signature() {
        let err = HarnessConfig::from_json(r#"{"crash_signatures": [""]}"#).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(HarnessConfig::from_json("{ timings: ").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        std::fs::write(&path, r#"{"snippet_len": 80}"#).unwrap();
        assert_eq!(HarnessConfig::load(&path).unwrap().snippet_len, 80);
    }
}
