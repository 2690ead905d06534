// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-facing reporters: `line`, `list`, and `dot`.

use super::Reporter;
use crate::{
    config::Config,
    list::{TestInstance, TestList},
    reporter::events::{FinalStatus, RunStats, StdioKind, TestResult, TestStatus},
};
use chrono::{DateTime, Local};
use owo_colors::OwoColorize;
use quire_metadata::{OutputChunk, ReportError};
use std::{
    io::{IsTerminal, Write},
    time::Duration,
};

fn color_enabled() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    std::io::stdout().is_terminal()
}

fn status_glyph(status: TestStatus, expected_mismatch: bool) -> &'static str {
    if expected_mismatch {
        return "✘";
    }
    match status {
        TestStatus::Passed | TestStatus::Failed => "✓",
        TestStatus::TimedOut => "⏱",
        TestStatus::Skipped => "-",
    }
}

fn format_duration(duration: Duration) -> String {
    if duration >= Duration::from_secs(1) {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// The `line` reporter prints one line per finished attempt; with
/// `verbose` (the `list` reporter) it also announces starts.
pub struct LineReporter {
    verbose: bool,
    color: bool,
}

impl LineReporter {
    pub(crate) fn new(verbose: bool) -> Self {
        Self {
            verbose,
            color: color_enabled(),
        }
    }

    fn print_summary(&self, stats: &RunStats, elapsed: Duration) {
        let mut parts = Vec::new();
        if stats.passed > 0 {
            parts.push(format!("{} passed", stats.passed));
        }
        if stats.failed > 0 {
            parts.push(format!("{} failed", stats.failed));
        }
        if stats.timed_out > 0 {
            parts.push(format!("{} timed out", stats.timed_out));
        }
        if stats.flaky > 0 {
            parts.push(format!("{} flaky", stats.flaky));
        }
        if stats.expected_flaky > 0 {
            parts.push(format!("{} expected-flaky", stats.expected_flaky));
        }
        if stats.skipped > 0 {
            parts.push(format!("{} skipped", stats.skipped));
        }
        if stats.worker_errors > 0 {
            parts.push(format!("{} worker errors", stats.worker_errors));
        }
        if parts.is_empty() {
            parts.push("no tests".to_owned());
        }
        let summary = format!("{} ({})", parts.join(", "), format_duration(elapsed));
        match (stats.final_status(), self.color) {
            (FinalStatus::Passed, true) => println!("\n{}", summary.green()),
            (FinalStatus::Failed, true) => println!("\n{}", summary.red()),
            (_, false) => println!("\n{summary}"),
        }
        if let Some(reason) = stats.cancel_reason {
            println!("run cancelled: {reason:?}");
        }
    }
}

impl Reporter for LineReporter {
    fn on_begin(&mut self, _config: &Config, list: &TestList) {
        println!("running {} tests", list.run_count());
        if self.verbose {
            for instance in &list.instances {
                println!("  {}", instance.full_title());
            }
        }
    }

    fn on_test_begin(&mut self, instance: &TestInstance, retry: usize, worker_index: usize) {
        if self.verbose {
            let retry_suffix = if retry > 0 {
                format!(" (retry #{retry})")
            } else {
                String::new()
            };
            println!(
                "  … {}{retry_suffix} [worker {worker_index}]",
                instance.full_title()
            );
        }
    }

    fn on_test_end(&mut self, instance: &TestInstance, result: &TestResult, will_retry: bool) {
        let mismatch = !result.expected_status.matches(result.status);
        let glyph = status_glyph(result.status, mismatch);
        let mut line = format!(
            "  {glyph} {} ({})",
            instance.full_title(),
            format_duration(result.duration)
        );
        if result.retry > 0 {
            line.push_str(&format!(" [retry #{}]", result.retry));
        }
        if result.slow {
            line.push_str(" [slow]");
        }
        if will_retry {
            line.push_str(" [will retry]");
        }
        if self.color {
            if mismatch {
                println!("{}", line.red());
            } else if result.status == TestStatus::Skipped {
                println!("{}", line.dimmed());
            } else {
                println!("{line}");
            }
        } else {
            println!("{line}");
        }
        if mismatch {
            if let Some(error) = &result.error {
                for l in error.message.lines() {
                    println!("      {l}");
                }
            }
        }
    }

    fn on_error(&mut self, error: &ReportError) {
        if self.color {
            eprintln!("{}", format!("error: {}", error.message).red());
        } else {
            eprintln!("error: {}", error.message);
        }
    }

    fn on_end(&mut self, stats: &RunStats, _start_time: DateTime<Local>, elapsed: Duration) {
        self.print_summary(stats, elapsed);
    }
}

/// The `dot` reporter prints one character per finished attempt.
pub struct DotReporter {
    color: bool,
    failures: Vec<(String, Option<ReportError>)>,
}

impl DotReporter {
    pub(crate) fn new() -> Self {
        Self {
            color: color_enabled(),
            failures: Vec::new(),
        }
    }
}

impl Reporter for DotReporter {
    fn on_test_end(&mut self, instance: &TestInstance, result: &TestResult, will_retry: bool) {
        let mismatch = !result.expected_status.matches(result.status);
        let glyph = match result.status {
            _ if mismatch && result.status == TestStatus::TimedOut => "T",
            _ if mismatch => "F",
            TestStatus::Skipped => "s",
            _ => ".",
        };
        if self.color && mismatch {
            print!("{}", glyph.red());
        } else {
            print!("{glyph}");
        }
        let _ = std::io::stdout().flush();
        if mismatch && !will_retry {
            self.failures
                .push((instance.full_title(), result.error.clone()));
        }
    }

    fn on_stdio(
        &mut self,
        _kind: StdioKind,
        _instance: Option<&TestInstance>,
        _chunk: &OutputChunk,
    ) {
        // Dots stay dots; output is available in the JSON report.
    }

    fn on_end(&mut self, stats: &RunStats, _start_time: DateTime<Local>, elapsed: Duration) {
        println!();
        for (title, error) in &self.failures {
            println!("failed: {title}");
            if let Some(error) = error {
                for line in error.message.lines() {
                    println!("    {line}");
                }
            }
        }
        let status = match stats.final_status() {
            FinalStatus::Passed => "ok",
            FinalStatus::Failed => "FAILED",
        };
        println!(
            "{status}. {} passed; {} failed; {} skipped; finished in {}",
            stats.passed,
            stats.failed + stats.timed_out,
            stats.skipped,
            format_duration(elapsed)
        );
    }
}
