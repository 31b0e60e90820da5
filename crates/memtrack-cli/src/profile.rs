//! The profile `memtrack run --output` writes: what ran, for how long, and
//! what the tracker's leak report said about it.
//!
//! The tracker prints its report to the child's stderr, so the numbers here
//! are read back out of that text with [`ReportParser`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const REPORT_HEADER: &str = "=== MEMORY LEAK REPORT ===";
const REPORT_FOOTER: &str = "=========================";

static TOTAL_ALLOCATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Total allocated: (\d+) bytes \((\d+) allocations\)$").unwrap());
static TOTAL_FREED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Total freed: (\d+) bytes \((\d+) frees\)$").unwrap());
static CURRENT_USAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Current usage: (\d+) bytes$").unwrap());
static PEAK_USAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Peak usage: (\d+) bytes$").unwrap());
static UNTRACKED_FREES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Untracked frees: (\d+)$").unwrap());
static LEAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^  LEAK: (\d+) bytes at 0x([0-9a-f]+) ").unwrap());

/// The counters from the top of a leak report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub total_allocated: u64,
    pub total_freed: u64,
    pub current_usage: u64,
    pub peak_usage: u64,
    pub allocation_count: u64,
    pub free_count: u64,
    pub untracked_frees: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leak {
    pub address: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedReport {
    pub stats: ReportStats,
    pub leaks: Vec<Leak>,
}

/// Picks leak reports out of a stream of stderr lines. Anything else the
/// program prints is skipped.
#[derive(Debug, Default)]
pub struct ReportParser {
    current: Option<ParsedReport>,
    last: Option<ParsedReport>,
}

fn number(re: &Regex, line: &str, group: usize) -> Option<u64> {
    re.captures(line)?.get(group)?.as_str().parse().ok()
}

impl ReportParser {
    pub fn feed(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == REPORT_HEADER {
            self.current = Some(ParsedReport::default());
            return;
        }
        let Some(report) = self.current.as_mut() else {
            return;
        };
        if line == REPORT_FOOTER {
            self.last = self.current.take();
            return;
        }

        let stats = &mut report.stats;
        if let Some(caps) = TOTAL_ALLOCATED.captures(line) {
            stats.total_allocated = caps[1].parse().unwrap_or(0);
            stats.allocation_count = caps[2].parse().unwrap_or(0);
        } else if let Some(caps) = TOTAL_FREED.captures(line) {
            stats.total_freed = caps[1].parse().unwrap_or(0);
            stats.free_count = caps[2].parse().unwrap_or(0);
        } else if let Some(usage) = number(&CURRENT_USAGE, line, 1) {
            stats.current_usage = usage;
        } else if let Some(peak) = number(&PEAK_USAGE, line, 1) {
            stats.peak_usage = peak;
        } else if let Some(frees) = number(&UNTRACKED_FREES, line, 1) {
            stats.untracked_frees = frees;
        } else if let Some(caps) = LEAK.captures(line) {
            if let (Ok(size), Ok(address)) =
                (caps[1].parse(), u64::from_str_radix(&caps[2], 16))
            {
                report.leaks.push(Leak { address, size });
            }
        }
    }

    /// The last report seen. One that was cut off (the child was killed
    /// mid-report) counts if nothing complete came after it.
    pub fn finish(self) -> Option<ParsedReport> {
        self.current.or(self.last)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakSummary {
    pub total_leaked_bytes: u64,
    pub leak_count: usize,
    pub largest_leak: Option<u64>,
    /// `(size, count)`, largest size first
    pub leaks_by_size: Vec<(u64, usize)>,
}

impl LeakSummary {
    pub fn from_leaks(leaks: &[Leak]) -> Self {
        let mut by_size: HashMap<u64, usize> = HashMap::new();
        for leak in leaks {
            *by_size.entry(leak.size).or_insert(0) += 1;
        }
        let mut leaks_by_size: Vec<_> = by_size.into_iter().collect();
        leaks_by_size.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        Self {
            total_leaked_bytes: leaks.iter().map(|leak| leak.size).sum(),
            leak_count: leaks.len(),
            largest_leak: leaks.iter().map(|leak| leak.size).max(),
            leaks_by_size,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileReport {
    pub pid: u32,
    pub command: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub exit_code: i32,
    /// Whether `--duration` ran out and the child was stopped
    pub timed_out: bool,
    /// `None` if the child printed no leak report (tracking disabled, or it
    /// was killed before it could)
    pub memory_stats: Option<ReportStats>,
    pub leaks: Vec<Leak>,
    pub leak_summary: LeakSummary,
}

impl ProfileReport {
    pub fn new(
        pid: u32,
        command: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        exit_code: i32,
        timed_out: bool,
        report: Option<ParsedReport>,
    ) -> Self {
        let duration = end_time
            .signed_duration_since(start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let (memory_stats, leaks) = match report {
            Some(report) => (Some(report.stats), report.leaks),
            None => (None, Vec::new()),
        };
        let leak_summary = LeakSummary::from_leaks(&leaks);
        Self {
            pid,
            command,
            start_time,
            end_time,
            duration,
            exit_code,
            timed_out,
            memory_stats,
            leaks,
            leak_summary,
        }
    }
}
