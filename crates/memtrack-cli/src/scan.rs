//! A line-oriented heuristic scan of C/C++ sources for allocations that are
//! never freed, or freed with the wrong function.
//!
//! This is pattern matching, not parsing: variables are matched by name
//! within one file, and a function is whatever `type name(...) {` header was
//! seen last.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use hashbrown::{HashMap, HashSet};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

pub const SOURCE_EXTENSIONS: [&str; 6] = ["c", "cc", "cpp", "cxx", "h", "hpp"];

static MALLOC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\w+)\s*=\s*(malloc|calloc|realloc)\s*\(").unwrap());
static NEW_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\w+)\s*=\s*new\s+\w+\s*\[").unwrap());
static NEW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\w+)\s*=\s*new\s+").unwrap());
static FREE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bfree\s*\(\s*(\w+)\s*\)").unwrap());
static DELETE_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bdelete\s*\[\s*\]\s*(\w+)").unwrap());
static DELETE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bdelete\s+(\w+)").unwrap());
static RETURN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\breturn\s+(\w+)").unwrap());
static FUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+)\s+(\w+)\s*\([^)]*\)\s*\{").unwrap());

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{} is not a file or directory", .0.display())]
    InvalidTarget(PathBuf),
    #[error("could not serialize the report")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocKind {
    Malloc,
    Calloc,
    Realloc,
    New,
    #[serde(rename = "new[]")]
    NewArray,
}

impl AllocKind {
    /// The free that pairs with this allocation
    pub fn matching_free(self) -> FreeKind {
        match self {
            Self::Malloc | Self::Calloc | Self::Realloc => FreeKind::Free,
            Self::New => FreeKind::Delete,
            Self::NewArray => FreeKind::DeleteArray,
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Realloc => "realloc",
            Self::New => "new",
            Self::NewArray => "new[]",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreeKind {
    Free,
    Delete,
    #[serde(rename = "delete[]")]
    DeleteArray,
}

impl fmt::Display for FreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Delete => "delete",
            Self::DeleteArray => "delete[]",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationSite {
    pub path: PathBuf,
    pub function: String,
    pub line: usize,
    pub variable: String,
    pub kind: AllocKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreeSite {
    pub path: PathBuf,
    pub function: String,
    pub line: usize,
    pub variable: String,
    pub kind: FreeKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub path: PathBuf,
    /// 1-based; 0 when the finding is about the file as a whole
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        };
        if self.line == 0 {
            write!(f, "{label}: {}: {}", self.path.display(), self.message)
        } else {
            write!(
                f,
                "{label}: {}:{}: {}",
                self.path.display(),
                self.line,
                self.message
            )
        }
    }
}

/// Everything found under one scan target.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Analysis {
    pub files: Vec<PathBuf>,
    pub allocations: Vec<AllocationSite>,
    pub frees: Vec<FreeSite>,
    /// `path:variable` for every variable reported as leaked
    pub leaked_variables: Vec<String>,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl Analysis {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    fn push(&mut self, finding: Finding) {
        match finding.severity {
            Severity::Error => self.errors.push(finding),
            Severity::Warning => self.warnings.push(finding),
        }
    }
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Scan a file, or every C/C++ source under a directory.
pub fn scan_path(target: &Path) -> Result<Analysis, ScanError> {
    let mut analysis = Analysis::default();
    if target.is_dir() {
        for entry in WalkDir::new(target).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_source_file(entry.path()) => {
                    scan_file(entry.path(), &mut analysis);
                }
                Ok(_) => {}
                Err(err) => analysis.push(Finding {
                    severity: Severity::Error,
                    path: err.path().unwrap_or(target).to_path_buf(),
                    line: 0,
                    message: format!("Filesystem error: {err}"),
                }),
            }
        }
    } else if target.is_file() {
        scan_file(target, &mut analysis);
    } else {
        return Err(ScanError::InvalidTarget(target.to_path_buf()));
    }
    info!(
        "scanned {} file(s): {} error(s), {} warning(s)",
        analysis.files.len(),
        analysis.errors.len(),
        analysis.warnings.len()
    );
    Ok(analysis)
}

/// Read and scan one file. An unreadable file becomes an error finding.
pub fn scan_file(path: &Path, analysis: &mut Analysis) {
    debug!("analyzing {}", path.display());
    match fs::read(path) {
        Ok(bytes) => scan_source(path, &String::from_utf8_lossy(&bytes), analysis),
        Err(err) => analysis.push(Finding {
            severity: Severity::Error,
            path: path.to_path_buf(),
            line: 0,
            message: format!("Cannot open file: {err}"),
        }),
    }
}

/// What one file contributes before cross-referencing
#[derive(Default)]
struct FileScan {
    allocations: Vec<AllocationSite>,
    frees: Vec<FreeSite>,
    /// function -> variables it returns after allocating them
    returned: HashMap<String, HashSet<String>>,
}

impl FileScan {
    fn scan_line(&mut self, path: &Path, line: &str, number: usize, function: &str) {
        let alloc = |variable: &str, kind| AllocationSite {
            path: path.to_path_buf(),
            function: function.to_owned(),
            line: number,
            variable: variable.to_owned(),
            kind,
        };
        if let Some(caps) = MALLOC.captures(line) {
            let kind = match &caps[2] {
                "malloc" => AllocKind::Malloc,
                "calloc" => AllocKind::Calloc,
                _ => AllocKind::Realloc,
            };
            self.allocations.push(alloc(&caps[1], kind));
        }
        // `new T[n]` also looks like `new T`
        if let Some(caps) = NEW_ARRAY.captures(line) {
            self.allocations.push(alloc(&caps[1], AllocKind::NewArray));
        } else if let Some(caps) = NEW.captures(line) {
            self.allocations.push(alloc(&caps[1], AllocKind::New));
        }

        let free = |variable: &str, kind| FreeSite {
            path: path.to_path_buf(),
            function: function.to_owned(),
            line: number,
            variable: variable.to_owned(),
            kind,
        };
        if let Some(caps) = FREE.captures(line) {
            self.frees.push(free(&caps[1], FreeKind::Free));
        }
        if let Some(caps) = DELETE_ARRAY.captures(line) {
            self.frees.push(free(&caps[1], FreeKind::DeleteArray));
        } else if let Some(caps) = DELETE.captures(line) {
            self.frees.push(free(&caps[1], FreeKind::Delete));
        }

        if let Some(caps) = RETURN.captures(line) {
            let variable = &caps[1];
            let allocated_here = self
                .allocations
                .iter()
                .any(|site| site.function == function && site.variable == variable);
            if allocated_here {
                self.returned
                    .entry(function.to_owned())
                    .or_default()
                    .insert(variable.to_owned());
            }
        }
    }

    fn is_returned(&self, site: &AllocationSite) -> bool {
        self.returned
            .get(&site.function)
            .is_some_and(|vars| vars.contains(&site.variable))
    }

    /// Cross-reference allocations and frees by variable name.
    fn findings(&self, path: &Path) -> (Vec<Finding>, Vec<String>) {
        let finding = |severity, line, message| Finding {
            severity,
            path: path.to_path_buf(),
            line,
            message,
        };

        let mut allocs_by_var: HashMap<&str, Vec<&AllocationSite>> = HashMap::new();
        for site in &self.allocations {
            allocs_by_var.entry(&site.variable).or_default().push(site);
        }
        let mut frees_by_var: HashMap<&str, Vec<&FreeSite>> = HashMap::new();
        for site in &self.frees {
            frees_by_var.entry(&site.variable).or_default().push(site);
        }

        let mut findings = Vec::new();
        let mut leaked = Vec::new();
        // first-seen order, so reports are stable
        let mut seen = HashSet::new();
        for alloc in &self.allocations {
            let var = alloc.variable.as_str();
            match frees_by_var.get(var) {
                None if self.is_returned(alloc) => findings.push(finding(
                    Severity::Warning,
                    alloc.line,
                    format!("Variable '{var}' allocated and returned - ensure caller frees it"),
                )),
                None => {
                    findings.push(finding(
                        Severity::Error,
                        alloc.line,
                        format!(
                            "Potential memory leak: variable '{var}' allocated with {} but never freed",
                            alloc.kind
                        ),
                    ));
                    if seen.insert(var) {
                        leaked.push(format!("{}:{var}", path.display()));
                    }
                }
                Some(frees) => {
                    for free in frees.iter().filter(|f| alloc.kind.matching_free() != f.kind) {
                        findings.push(finding(
                            Severity::Error,
                            free.line,
                            format!(
                                "Type mismatch: '{var}' allocated with {} but freed with {}",
                                alloc.kind, free.kind
                            ),
                        ));
                    }
                }
            }
        }
        for free in &self.frees {
            if !allocs_by_var.contains_key(free.variable.as_str()) {
                findings.push(finding(
                    Severity::Warning,
                    free.line,
                    format!(
                        "Variable '{}' freed but no allocation found in this file",
                        free.variable
                    ),
                ));
            }
        }
        (findings, leaked)
    }
}

/// Scan `source` as if it were the contents of `path`.
pub fn scan_source(path: &Path, source: &str, analysis: &mut Analysis) {
    let mut scan = FileScan::default();
    let mut function = String::from("global");
    for (i, line) in source.lines().enumerate() {
        let line = line.split_once("//").map_or(line, |(code, _)| code);
        if line.trim().is_empty() {
            continue;
        }
        if let Some(caps) = FUNCTION.captures(line) {
            function = caps[2].to_owned();
        }
        scan.scan_line(path, line, i + 1, &function);
    }

    let (findings, leaked) = scan.findings(path);
    analysis.files.push(path.to_path_buf());
    analysis.leaked_variables.extend(leaked);
    for finding in findings {
        analysis.push(finding);
    }
    analysis.allocations.extend(scan.allocations);
    analysis.frees.extend(scan.frees);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Text,
    Markdown,
    Json,
}

pub fn render(analysis: &Analysis, format: Format) -> Result<String, ScanError> {
    Ok(match format {
        Format::Text => render_text(analysis),
        Format::Markdown => render_markdown(analysis),
        Format::Json => serde_json::to_string_pretty(analysis)?,
    })
}

fn render_text(analysis: &Analysis) -> String {
    use fmt::Write;

    let mut out = String::new();
    _ = writeln!(out, "=== STATIC ANALYSIS REPORT ===");
    _ = writeln!(out, "Files analyzed: {}", analysis.files.len());
    _ = writeln!(out, "Total allocations found: {}", analysis.allocations.len());
    _ = writeln!(out, "Total deallocations found: {}", analysis.frees.len());
    _ = writeln!(out, "Potential leaks: {}", analysis.leaked_variables.len());
    _ = writeln!(out, "Errors: {}", analysis.errors.len());
    _ = writeln!(out, "Warnings: {}", analysis.warnings.len());
    for (title, findings) in [("ERRORS", &analysis.errors), ("WARNINGS", &analysis.warnings)] {
        if !findings.is_empty() {
            _ = writeln!(out, "\n=== {title} ===");
            for finding in findings {
                _ = writeln!(out, "{finding}");
            }
        }
    }
    if analysis.is_clean() {
        _ = writeln!(out, "\nNo memory leak issues detected!");
    }
    out
}

fn render_markdown(analysis: &Analysis) -> String {
    use fmt::Write;

    let mut out = String::new();
    _ = writeln!(out, "# Static Memory Analysis Report\n");
    _ = writeln!(out, "## Summary\n");
    _ = writeln!(out, "- Files analyzed: {}", analysis.files.len());
    _ = writeln!(out, "- Total allocations found: {}", analysis.allocations.len());
    _ = writeln!(out, "- Total deallocations found: {}", analysis.frees.len());
    _ = writeln!(out, "- Potential leaks: {}", analysis.leaked_variables.len());
    _ = writeln!(out, "- Errors: {}", analysis.errors.len());
    _ = writeln!(out, "- Warnings: {}", analysis.warnings.len());
    for (title, findings) in [("Errors", &analysis.errors), ("Warnings", &analysis.warnings)] {
        if !findings.is_empty() {
            _ = writeln!(out, "\n## {title}\n");
            for finding in findings {
                _ = writeln!(out, "- {finding}");
            }
        }
    }
    _ = writeln!(out, "\n## Allocation Details\n");
    for site in &analysis.allocations {
        _ = writeln!(
            out,
            "- {}:{} in {}(): {} = {}()",
            site.path.display(),
            site.line,
            site.function,
            site.variable,
            site.kind
        );
    }
    _ = writeln!(out, "\n## Deallocation Details\n");
    for site in &analysis.frees {
        _ = writeln!(
            out,
            "- {}:{} in {}(): {}({})",
            site.path.display(),
            site.line,
            site.function,
            site.kind,
            site.variable
        );
    }
    out
}
