//! Test suites: JSON files of declarative checks, plus the built-in smoke
//! suite used when none is given.
//!
//! ```json
//! [
//!   { "category": "FS", "name": "pwd", "command": "pwd", "expect": { "regex": "^/" } },
//!   { "category": "ML", "name": "train", "command": "jarvis train",
//!     "expect": { "contains": "PASSED" }, "timeout_ms": 1800000,
//!     "completion": "TESTS PASSED|FAILED" }
//! ]
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::case::{TestCase, Validator};
use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorSpec {
    Contains(String),
    NotContains(String),
    Equals(String),
    Regex(String),
    NonEmpty,
    Any,
    AllOf(Vec<ValidatorSpec>),
    AnyOf(Vec<ValidatorSpec>),
}

impl ValidatorSpec {
    pub fn build(&self) -> HarnessResult<Validator> {
        Ok(match self {
            Self::Contains(s) => Validator::Contains(s.clone()),
            Self::NotContains(s) => Validator::NotContains(s.clone()),
            Self::Equals(s) => Validator::Equals(s.clone()),
            Self::Regex(p) => Validator::Matches(compile(p)?),
            Self::NonEmpty => Validator::NonEmpty,
            Self::Any => Validator::Any,
            Self::AllOf(specs) => {
                Validator::AllOf(specs.iter().map(Self::build).collect::<HarnessResult<_>>()?)
            }
            Self::AnyOf(specs) => {
                Validator::AnyOf(specs.iter().map(Self::build).collect::<HarnessResult<_>>()?)
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteEntry {
    pub category: String,
    pub name: String,
    pub command: String,
    pub expect: ValidatorSpec,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub completion: Option<String>,
}

impl SuiteEntry {
    pub fn build(&self) -> HarnessResult<TestCase> {
        let validator = self
            .expect
            .build()
            .map_err(|e| HarnessError::Suite(format!("{}/{}: {e}", self.category, self.name)))?;
        let mut case = TestCase::new(&self.category, &self.name, &self.command, validator);
        if let Some(ms) = self.timeout_ms {
            case = case.with_timeout(Duration::from_millis(ms));
        }
        if let Some(pattern) = &self.completion {
            case = case.with_completion(compile(pattern)?);
        }
        Ok(case)
    }
}

fn compile(pattern: &str) -> HarnessResult<Regex> {
    Regex::new(pattern).map_err(|e| HarnessError::pattern(pattern, e))
}

pub fn parse_suite(text: &str) -> HarnessResult<Vec<TestCase>> {
    let entries: Vec<SuiteEntry> =
        serde_json::from_str(text).map_err(|e| HarnessError::Suite(e.to_string()))?;
    if entries.is_empty() {
        return Err(HarnessError::Suite("suite has no tests".into()));
    }
    entries.iter().map(SuiteEntry::build).collect()
}

pub fn load_suite(path: &Path) -> HarnessResult<Vec<TestCase>> {
    let text = fs_err::read_to_string(path)?;
    parse_suite(&text)
}

/// Keeps only the named categories (case-insensitive). An empty filter keeps
/// everything.
pub fn filter_categories(cases: Vec<TestCase>, categories: &[String]) -> Vec<TestCase> {
    if categories.is_empty() {
        return cases;
    }
    cases
        .into_iter()
        .filter(|c| categories.iter().any(|want| want.eq_ignore_ascii_case(&c.category)))
        .collect()
}

/// Shell, file system and system-information basics.
pub fn default_suite() -> Vec<TestCase> {
    use Validator::*;

    vec![
        TestCase::new("Shell", "echo", "echo hello_42", Equals("hello_42".into())),
        TestCase::new(
            "Shell",
            "help",
            "help",
            AllOf(vec![Contains("ls".into()), Contains("echo".into())]),
        ),
        TestCase::new("Shell", "clear", "clear", Any),
        TestCase::new("Shell", "unknown command", "definitely_not_a_command", NonEmpty),
        TestCase::new(
            "FS",
            "pwd",
            "pwd",
            Validator::custom(|out| Ok(out.starts_with('/') && !out.contains('\n'))),
        ),
        TestCase::new("FS", "mkdir", "mkdir harness_dir", NotContains("rror".into())),
        TestCase::new("FS", "ls shows dir", "ls", Contains("harness_dir".into())),
        TestCase::new(
            "FS",
            "write file",
            "echo probe_77 > harness_dir/probe.txt",
            NotContains("rror".into()),
        ),
        TestCase::new("FS", "read file", "cat harness_dir/probe.txt", Equals("probe_77".into())),
        TestCase::new("FS", "cd", "cd harness_dir", NotContains("rror".into())),
        TestCase::new("FS", "pwd after cd", "pwd", Contains("harness_dir".into())),
        TestCase::new("FS", "cd back", "cd /", Any),
        TestCase::new(
            "System",
            "uname",
            "uname -a",
            AllOf(vec![Contains("trustos".into()), Contains("x86_64".into())]),
        ),
        TestCase::new("System", "uptime", "uptime", NonEmpty),
        TestCase::new("System", "free", "free", NonEmpty),
        TestCase::new("System", "ps", "ps", NonEmpty),
        TestCase::new("System", "whoami", "whoami", NonEmpty),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_entry() {
        let suite = parse_suite(
            r#"[
                {"category": "ML", "name": "train", "command": "jarvis train",
                 "expect": {"all_of": [{"contains": "PASSED"}, {"not_contains": "nan"}]},
                 "timeout_ms": 1800000, "completion": "TESTS PASSED|FAILED"},
                {"category": "Shell", "name": "clear", "command": "clear", "expect": "any"}
            ]"#,
        )
        .unwrap();
        assert_eq!(suite.len(), 2);
        assert_eq!(suite[0].timeout, Some(Duration::from_secs(1800)));
        assert!(suite[0].completion.as_ref().unwrap().is_match("=== ALL 3/3 TESTS PASSED ==="));
        assert_eq!(suite[0].validator.check("ALL PASSED"), Ok(true));
        assert!(suite[1].completion.is_none());
        assert_eq!(suite[1].validator.check(""), Ok(true));
    }

    #[test]
    fn test_rejects_unknown_validator() {
        let err = parse_suite(
            r#"[{"category": "a", "name": "b", "command": "c", "expect": {"startswith": "x"}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Suite(_)));
    }

    #[test]
    fn test_rejects_bad_regex() {
        let err = parse_suite(
            r#"[{"category": "a", "name": "b", "command": "c", "expect": {"regex": "("}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Suite(_)));
        let err = parse_suite(
            r#"[{"category":"a","name":"b","command":"c","expect":"any","completion":"[z-a]"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Pattern { .. }));
    }

    #[test]
    fn test_rejects_empty_suite() {
        assert!(parse_suite("[]").is_err());
    }

    #[test]
    fn test_filter_categories() {
        let kept = filter_categories(default_suite(), &["fs".to_string()]);
        assert!(!kept.is_empty());
        assert!(kept.iter().all(|c| c.category == "FS"));
        assert_eq!(filter_categories(default_suite(), &[]).len(), default_suite().len());
    }

    #[test]
    fn test_default_suite_is_well_formed() {
        let suite = default_suite();
        let mut labels: Vec<_> = suite.iter().map(|c| c.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), suite.len());
    }
}
