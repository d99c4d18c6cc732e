use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::crash::CrashEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    /// The check could not be evaluated: broken validator or lost transport.
    Error,
    Crash,
    Skip,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Crash => "CRASH",
            Self::Skip => "SKIP",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub category: String,
    pub name: String,
    pub command: String,
    pub status: Status,
    /// Normalized output, truncated.
    pub output_snippet: String,
    /// Why the status is what it is, when that is not obvious from the output.
    pub detail: Option<String>,
    pub timed_out: bool,
    #[serde(with = "crate::config::millis")]
    pub elapsed: Duration,
}

impl TestResult {
    pub fn label(&self) -> String {
        format!("{}: {}", self.category, self.name)
    }
}

/// Cuts `text` to at most `max_chars`, marking the cut.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub category: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub crashed: usize,
    pub skipped: usize,
}

impl CategoryStats {
    fn add(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Pass => self.passed += 1,
            Status::Fail => self.failed += 1,
            Status::Error => self.errors += 1,
            Status::Crash => self.crashed += 1,
            Status::Skip => self.skipped += 1,
        }
    }

    /// Passed over executed (skips excluded), as a percentage.
    pub fn pass_rate(&self) -> f64 {
        let executed = self.total - self.skipped;
        if executed == 0 {
            0.0
        } else {
            self.passed as f64 * 100.0 / executed as f64
        }
    }
}

/// Append-only store of a run's results and crash events.
#[derive(Debug, Default)]
pub struct ResultRecorder {
    results: Vec<TestResult>,
    crashes: Vec<CrashEvent>,
}

impl ResultRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: TestResult) {
        self.results.push(result);
    }

    pub fn record_crash(&mut self, event: CrashEvent) {
        self.crashes.push(event);
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn crashes(&self) -> &[CrashEvent] {
        &self.crashes
    }

    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn pass_count(&self) -> usize {
        self.count(Status::Pass)
    }

    /// Every result that is not a pass or a skip.
    pub fn problems(&self) -> impl Iterator<Item = &TestResult> {
        self.results
            .iter()
            .filter(|r| !matches!(r.status, Status::Pass | Status::Skip))
    }

    pub fn failures_of<'a>(
        &'a self,
        category: &'a str,
    ) -> impl Iterator<Item = &'a TestResult> + 'a {
        self.problems().filter(move |r| r.category == category)
    }

    /// Totals for the whole run.
    pub fn summary(&self) -> CategoryStats {
        let mut stats = CategoryStats {
            category: "all".to_string(),
            ..Default::default()
        };
        for r in &self.results {
            stats.add(r.status);
        }
        stats
    }

    /// Per-category totals, in order of first appearance.
    pub fn category_breakdown(&self) -> Vec<CategoryStats> {
        let mut out: Vec<CategoryStats> = Vec::new();
        for r in &self.results {
            let idx = match out.iter().position(|s| s.category == r.category) {
                Some(idx) => idx,
                None => {
                    out.push(CategoryStats {
                        category: r.category.clone(),
                        ..Default::default()
                    });
                    out.len() - 1
                }
            };
            out[idx].add(r.status);
        }
        out
    }

    /// True when every executed test passed.
    pub fn all_passed(&self) -> bool {
        self.problems().next().is_none()
    }
}

#[cfg(test)]
pub(crate) fn result(category: &str, name: &str, status: Status) -> TestResult {
    TestResult {
        category: category.into(),
        name: name.into(),
        command: name.into(),
        status,
        output_snippet: String::new(),
        detail: None,
        timed_out: false,
        elapsed: Duration::from_millis(10),
    }
}
