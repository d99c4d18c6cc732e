//! Run reports: a plain-text artifact for diffing across runs, an optional
//! JSON document, and the coloured console summary.
//!
//! The text layout is line-oriented so `grep '^FAIL'` and friends work. Apart
//! from the header, two runs with the same outcomes render identically.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::crash::CrashEvent;
use crate::error::{HarnessError, HarnessResult};
use crate::record::{CategoryStats, ResultRecorder, Status, TestResult};

#[derive(Debug, Clone)]
pub struct RunInfo {
    pub started: DateTime<Utc>,
    pub boot_duration: Duration,
    pub test_duration: Duration,
    /// Transport description, e.g. `tcp serial 127.0.0.1:5555`.
    pub target: String,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    started: String,
    target: &'a str,
    boot_ms: u64,
    test_ms: u64,
    summary: CategoryStats,
    pass_rate: f64,
    categories: Vec<CategoryStats>,
    crashes: &'a [CrashEvent],
    results: &'a [TestResult],
}

pub struct Reporter<'a> {
    info: &'a RunInfo,
    recorder: &'a ResultRecorder,
}

impl<'a> Reporter<'a> {
    pub fn new(info: &'a RunInfo, recorder: &'a ResultRecorder) -> Self {
        Self { info, recorder }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let summary = self.recorder.summary();

        // Writing to a String cannot fail.
        let _ = writeln!(out, "CONSOLE TEST REPORT");
        let started = self.info.started.to_rfc3339_opts(SecondsFormat::Secs, true);
        let _ = writeln!(out, "started:        {started}");
        let _ = writeln!(out, "target:         {}", self.info.target);
        let _ = writeln!(out, "boot duration:  {}", seconds(self.info.boot_duration));
        let _ = writeln!(out, "test duration:  {}", seconds(self.info.test_duration));

        let _ = writeln!(out, "\nSUMMARY");
        let _ = writeln!(out, "  total    {}", summary.total);
        let _ = writeln!(out, "  passed   {}", summary.passed);
        let _ = writeln!(out, "  failed   {}", summary.failed);
        let _ = writeln!(out, "  errors   {}", summary.errors);
        let _ = writeln!(out, "  crashed  {}", summary.crashed);
        let _ = writeln!(out, "  skipped  {}", summary.skipped);
        let _ = writeln!(out, "  rate     {:.1}%", summary.pass_rate());

        let breakdown = self.recorder.category_breakdown();
        let width = breakdown.iter().map(|c| c.category.len()).max().unwrap_or(0);
        let _ = writeln!(out, "\nCATEGORIES");
        for cat in &breakdown {
            let _ = writeln!(
                out,
                "  {:<width$}  {}/{}  {:.1}%",
                cat.category,
                cat.passed,
                cat.total - cat.skipped,
                cat.pass_rate(),
            );
        }

        let _ = writeln!(out, "\nCRASHES");
        if self.recorder.crashes().is_empty() {
            let _ = writeln!(out, "  none");
        }
        for crash in self.recorder.crashes() {
            let _ = writeln!(out, "  [{}] {} | {}", crash.context, crash.signature, crash.excerpt);
        }

        let _ = writeln!(out, "\nDETAILS");
        for r in self.recorder.results() {
            let _ = writeln!(out, "{:<5}  {}  $ {}", r.status, r.label(), r.command);
            if matches!(r.status, Status::Pass | Status::Skip) {
                continue;
            }
            if let Some(detail) = &r.detail {
                let _ = writeln!(out, "       detail: {detail}");
            }
            if r.timed_out {
                let _ = writeln!(out, "       timed out");
            }
            let _ = writeln!(out, "       output: {}", one_line(&r.output_snippet));
        }
        out
    }

    pub fn render_json(&self) -> HarnessResult<String> {
        let summary = self.recorder.summary();
        let report = JsonReport {
            started: self.info.started.to_rfc3339_opts(SecondsFormat::Secs, true),
            target: &self.info.target,
            boot_ms: self.info.boot_duration.as_millis() as u64,
            test_ms: self.info.test_duration.as_millis() as u64,
            pass_rate: summary.pass_rate(),
            summary,
            categories: self.recorder.category_breakdown(),
            crashes: self.recorder.crashes(),
            results: self.recorder.results(),
        };
        serde_json::to_string_pretty(&report).map_err(|e| HarnessError::Report(e.to_string()))
    }

    pub fn write_text(&self, path: &Path) -> HarnessResult<()> {
        write_file(path, &self.render_text())?;
        tracing::info!(path = %path.display(), "Wrote report");
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        write_file(path, &self.render_json()?)?;
        tracing::info!(path = %path.display(), "Wrote JSON report");
        Ok(())
    }

    /// Summary for a terminal: totals, categories, and every result that
    /// did not pass.
    pub fn render_console(&self, color: bool) -> String {
        let paint = |status: Status, text: &str| -> String {
            if !color {
                return text.to_string();
            }
            let code = match status {
                Status::Pass => "32",
                Status::Fail | Status::Crash => "31",
                Status::Error => "35",
                Status::Skip => "33",
            };
            format!("\x1b[{code}m{text}\x1b[0m")
        };

        let mut out = String::new();
        let summary = self.recorder.summary();

        let problems: Vec<_> = self.recorder.problems().collect();
        if !problems.is_empty() {
            let _ = writeln!(out, "Problems:");
            for r in problems {
                let _ = writeln!(out, "  {} {}", paint(r.status, r.status.as_str()), r.label());
                if let Some(detail) = &r.detail {
                    let _ = writeln!(out, "      {detail}");
                }
                if !r.output_snippet.is_empty() {
                    let _ = writeln!(out, "      output: {}", one_line(&r.output_snippet));
                }
            }
            let _ = writeln!(out);
        }

        for cat in self.recorder.category_breakdown() {
            let status = if cat.passed + cat.skipped == cat.total {
                Status::Pass
            } else {
                Status::Fail
            };
            let ratio = format!(
                "{}/{} ({:.1}%)",
                cat.passed,
                cat.total - cat.skipped,
                cat.pass_rate()
            );
            let _ = writeln!(out, "  {:<12} {}", cat.category, paint(status, &ratio));
        }

        let mut parts = Vec::new();
        for (status, count) in [
            (Status::Pass, summary.passed),
            (Status::Fail, summary.failed),
            (Status::Error, summary.errors),
            (Status::Crash, summary.crashed),
            (Status::Skip, summary.skipped),
        ] {
            if count > 0 {
                parts.push(paint(status, &format!("{count} {}", status.as_str().to_lowercase())));
            }
        }
        if parts.is_empty() {
            parts.push("no tests".to_string());
        }
        let _ = writeln!(
            out,
            "====== {} ({:.1}%) in {} ======",
            parts.join(", "),
            summary.pass_rate(),
            seconds(self.info.test_duration),
        );
        out
    }

    pub fn print_console(&self, color: bool) {
        print!("{}", self.render_console(color));
    }
}

fn write_file(path: &Path, contents: &str) -> HarnessResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, contents)?;
    Ok(())
}

fn seconds(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

/// Keeps multi-line output on a single report line.
fn one_line(text: &str) -> String {
    if text.is_empty() {
        return "(empty)".to_string();
    }
    text.replace('\\', "\\\\").replace('\n', "\\n")
}
