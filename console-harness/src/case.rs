use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::transport::keys;

pub type CheckFn = dyn Fn(&str) -> Result<bool, String> + Send + Sync;

/// Predicate over normalized output.
#[derive(Clone)]
pub enum Validator {
    Contains(String),
    NotContains(String),
    Equals(String),
    Matches(Regex),
    NonEmpty,
    Any,
    AllOf(Vec<Validator>),
    AnyOf(Vec<Validator>),
    Custom(Arc<CheckFn>),
}

impl Validator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// `Err` means the check itself is broken, not that the output is wrong.
    /// A panicking custom check is reported the same way.
    pub fn check(&self, output: &str) -> Result<bool, String> {
        match self {
            Self::Contains(needle) => Ok(output.contains(needle.as_str())),
            Self::NotContains(needle) => Ok(!output.contains(needle.as_str())),
            Self::Equals(expected) => Ok(output == expected),
            Self::Matches(re) => Ok(re.is_match(output)),
            Self::NonEmpty => Ok(!output.trim().is_empty()),
            Self::Any => Ok(true),
            Self::AllOf(all) => {
                for v in all {
                    if !v.check(output)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::AnyOf(any) => {
                for v in any {
                    if v.check(output)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Custom(f) => match catch_unwind(AssertUnwindSafe(|| f(output))) {
                Ok(result) => result,
                Err(payload) => {
                    Err(format!("validator panicked: {}", panic_message(payload.as_ref())))
                }
            },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains(s) => write!(f, "Contains({s:?})"),
            Self::NotContains(s) => write!(f, "NotContains({s:?})"),
            Self::Equals(s) => write!(f, "Equals({s:?})"),
            Self::Matches(re) => write!(f, "Matches({:?})", re.as_str()),
            Self::NonEmpty => f.write_str("NonEmpty"),
            Self::Any => f.write_str("Any"),
            Self::AllOf(v) => f.debug_tuple("AllOf").field(v).finish(),
            Self::AnyOf(v) => f.debug_tuple("AnyOf").field(v).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One check against the target. Immutable once built.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub category: String,
    pub name: String,
    /// Text typed at the prompt; `{UP}`-style tokens stand for special keys.
    pub command: String,
    pub validator: Validator,
    /// Overrides the harness-wide command timeout.
    pub timeout: Option<Duration>,
    /// Banner that ends the command instead of the prompt.
    pub completion: Option<Regex>,
}

impl TestCase {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        validator: Validator,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            command: command.into(),
            validator,
            timeout: None,
            completion: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_completion(mut self, pattern: Regex) -> Self {
        self.completion = Some(pattern);
        self
    }

    /// `category: name`, used as the crash context and in logs.
    pub fn label(&self) -> String {
        format!("{}: {}", self.category, self.name)
    }

    /// Bytes to transmit, terminator included.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = keys::expand_tokens(&self.command);
        bytes.push(b'\r');
        bytes
    }
}
