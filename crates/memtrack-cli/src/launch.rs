//! Run a program with the tracker preloaded into it.

use std::{
    env,
    ffi::{OsStr, OsString},
    fs::File,
    io::{self, BufRead, BufReader, Write},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, ChildStderr, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{info, warn};
use thiserror::Error;

use crate::profile::{ParsedReport, ProfileReport, ReportParser};

pub const LIBRARY_NAME: &str = "libmemtrack.so";

/// How long a child stopped by `--duration` gets to print its report after
/// SIGTERM, before it is killed outright
const TERM_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("preload library {} does not exist", .0.display())]
    LibraryNotFound(PathBuf),
    #[error("could not find the directory of the running executable")]
    NoExecutable(#[source] io::Error),
    #[error("could not create log file {}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start {}", program.to_string_lossy())]
    Spawn {
        program: OsString,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for the child process")]
    Wait(#[source] io::Error),
    #[error("could not write profile to {}", path.display())]
    Profile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Explicit library path (`--preload` or `MEMTRACK_LIB`)
    pub preload: Option<PathBuf>,
    /// Send the child's stderr, and so the report, here
    pub log: Option<PathBuf>,
    pub verbose: bool,
    pub disable: bool,
    /// Stop the child once it has run this long
    pub duration: Option<Duration>,
    /// Write a JSON [`ProfileReport`] here
    pub output: Option<PathBuf>,
    /// Program and arguments
    pub command: Vec<OsString>,
}

/// The library to preload: `explicit` if given, else [`LIBRARY_NAME`] next
/// to our own executable.
pub fn locate_library(explicit: Option<&Path>) -> Result<PathBuf, LaunchError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let exe = env::current_exe().map_err(LaunchError::NoExecutable)?;
            exe.with_file_name(LIBRARY_NAME)
        }
    };
    if path.is_file() {
        Ok(path)
    } else {
        Err(LaunchError::LibraryNotFound(path))
    }
}

/// `library` in front of whatever was already being preloaded.
pub fn preload_value(library: &Path, existing: Option<&OsStr>) -> OsString {
    let mut value = library.as_os_str().to_os_string();
    if let Some(existing) = existing.filter(|existing| !existing.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

/// The child's exit code, or `128 + signal` if a signal killed it.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

pub fn build_command(options: &LaunchOptions, library: &Path) -> Result<Command, LaunchError> {
    let (program, args) = options
        .command
        .split_first()
        .ok_or_else(|| LaunchError::Spawn {
            program: OsString::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "no command given"),
        })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .env(
            "LD_PRELOAD",
            preload_value(library, env::var_os("LD_PRELOAD").as_deref()),
        )
        .env("MEMTRACK_ENABLE", if options.disable { "0" } else { "1" })
        .env("MEMTRACK_VERBOSE", if options.verbose { "1" } else { "0" });

    if options.output.is_some() {
        // read back by `collect_report()`
        command.stderr(Stdio::piped());
    } else if let Some(path) = &options.log {
        command.stderr(Stdio::from(create_log(path)?));
    }
    Ok(command)
}

fn create_log(path: &Path) -> Result<File, LaunchError> {
    File::create(path).map_err(|source| LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy the child's stderr to `sink` line by line, and pick the leak report
/// out of it on the way.
fn collect_report(
    stderr: ChildStderr,
    mut sink: Box<dyn Write + Send>,
) -> JoinHandle<Option<ParsedReport>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut parser = ReportParser::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    _ = sink.write_all(&line);
                    parser.feed(&String::from_utf8_lossy(&line));
                }
            }
        }
        _ = sink.flush();
        parser.finish()
    })
}

fn signal(child: &Child, sig: libc::c_int) {
    // SAFETY: `kill()` has no memory safety preconditions
    unsafe { libc::kill(child.id() as libc::pid_t, sig) };
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Wait for the child, stopping it if it outlives `limit`: SIGTERM first,
/// which the tracker answers with its report, then SIGKILL. Also returns
/// whether the limit was hit.
pub fn wait_with_limit(
    child: &mut Child,
    limit: Option<Duration>,
) -> io::Result<(ExitStatus, bool)> {
    let Some(limit) = limit else {
        return Ok((child.wait()?, false));
    };
    if let Some(status) = wait_until(child, Instant::now() + limit)? {
        return Ok((status, false));
    }

    warn!("Maximum duration reached, terminating process");
    signal(child, libc::SIGTERM);
    if let Some(status) = wait_until(child, Instant::now() + TERM_GRACE)? {
        return Ok((status, true));
    }
    warn!("Process ignored SIGTERM, killing it");
    child.kill()?;
    Ok((child.wait()?, true))
}

fn command_line(command: &[OsString]) -> String {
    command
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_profile(path: &Path, profile: &ProfileReport) -> Result<(), LaunchError> {
    let error = |source| LaunchError::Profile {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(error)?;
    serde_json::to_writer_pretty(file, profile).map_err(|err| error(err.into()))
}

fn log_summary(profile: &ProfileReport) {
    let summary = &profile.leak_summary;
    match &profile.memory_stats {
        None => warn!("No leak report from the process, the profile has no memory statistics"),
        Some(_) if summary.leak_count == 0 => info!("No memory leaks detected!"),
        Some(stats) => {
            info!(
                "{} leaks, {} bytes (largest {} bytes); peak usage {} bytes",
                summary.leak_count,
                summary.total_leaked_bytes,
                summary.largest_leak.unwrap_or(0),
                stats.peak_usage
            );
            for (size, count) in &summary.leaks_by_size {
                info!("  {size} bytes x {count}");
            }
        }
    }
}

/// Ignores terminal interrupts in this process for as long as it lives, so
/// that Ctrl-C reaches (only) the child, which flushes its own report.
struct IgnoreInterrupts {
    previous: [(libc::c_int, libc::sighandler_t); 2],
}

impl IgnoreInterrupts {
    fn new() -> Self {
        let previous = [libc::SIGINT, libc::SIGQUIT]
            .map(|sig| (sig, unsafe { libc::signal(sig, libc::SIG_IGN) }));
        Self { previous }
    }
}

impl Drop for IgnoreInterrupts {
    fn drop(&mut self) {
        for (sig, handler) in self.previous {
            unsafe { libc::signal(sig, handler) };
        }
    }
}

/// Run the command to completion and return the exit code to pass on.
pub fn run(options: &LaunchOptions) -> Result<i32, LaunchError> {
    let library = locate_library(options.preload.as_deref())?;
    let mut command = build_command(options, &library)?;

    // opened before the spawn, so a bad path fails without running anything
    let sink: Option<Box<dyn Write + Send>> = match (&options.output, &options.log) {
        (None, _) => None,
        (Some(_), Some(log)) => Some(Box::new(create_log(log)?)),
        (Some(_), None) => Some(Box::new(io::stderr())),
    };

    let start_time = Utc::now();
    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: options.command[0].clone(),
        source,
    })?;
    // after the spawn, so the child starts with the default dispositions
    let _interrupts = IgnoreInterrupts::new();
    let pid = child.id();
    info!("Monitoring process PID: {pid}");

    let collector = match (sink, child.stderr.take()) {
        (Some(sink), Some(stderr)) => Some(collect_report(stderr, sink)),
        _ => None,
    };

    let (status, timed_out) =
        wait_with_limit(&mut child, options.duration).map_err(LaunchError::Wait)?;
    let end_time = Utc::now();
    if let Some(signal) = status.signal() {
        warn!("Process terminated by signal: {signal}");
    } else if let Some(code) = status.code() {
        info!("Process exited with status: {code}");
    }
    let code = exit_code(status);

    if let (Some(path), Some(collector)) = (&options.output, collector) {
        // a reader that panicked counts as no report
        let report = collector.join().unwrap_or(None);
        let profile = ProfileReport::new(
            pid,
            command_line(&options.command),
            start_time,
            end_time,
            code,
            timed_out,
            report,
        );
        log_summary(&profile);
        write_profile(path, &profile)?;
        info!("Report saved to: {}", path.display());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn options(command: &[&str], library: &Path) -> LaunchOptions {
        LaunchOptions {
            preload: Some(library.to_path_buf()),
            command: command.iter().map(OsString::from).collect(),
            ..Default::default()
        }
    }

    /// ld.so skips a preload entry it can't load, so any file will do
    fn fake_library(dir: &Path) -> PathBuf {
        let path = dir.join(LIBRARY_NAME);
        fs::write(&path, b"not an ELF file").unwrap();
        path
    }

    #[test]
    fn preload_is_prepended() {
        let lib = Path::new("/opt/libmemtrack.so");
        assert_eq!(preload_value(lib, None), OsString::from("/opt/libmemtrack.so"));
        assert_eq!(
            preload_value(lib, Some(OsStr::new(""))),
            OsString::from("/opt/libmemtrack.so")
        );
        assert_eq!(
            preload_value(lib, Some(OsStr::new("libfoo.so"))),
            OsString::from("/opt/libmemtrack.so:libfoo.so")
        );
    }

    #[test]
    fn exit_codes_pass_through() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), 128 + libc::SIGTERM);
    }

    #[test]
    fn missing_library_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.so");
        assert!(matches!(
            locate_library(Some(&missing)),
            Err(LaunchError::LibraryNotFound(path)) if path == missing
        ));
    }

    #[test]
    fn command_carries_the_tracker_environment() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let mut options = options(&["true", "--flag"], &lib);
        options.verbose = true;
        let command = build_command(&options, &lib).unwrap();

        assert_eq!(command.get_program(), "true");
        assert_eq!(command.get_args().collect::<Vec<_>>(), ["--flag"]);
        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs.contains(&(OsStr::new("MEMTRACK_ENABLE"), Some(OsStr::new("1")))));
        assert!(envs.contains(&(OsStr::new("MEMTRACK_VERBOSE"), Some(OsStr::new("1")))));
        let preload = envs
            .iter()
            .find(|(key, _)| *key == "LD_PRELOAD")
            .and_then(|(_, value)| *value)
            .unwrap();
        assert!(preload.to_string_lossy().starts_with(&*lib.to_string_lossy()));
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        assert!(matches!(
            build_command(&options(&[], &lib), &lib),
            Err(LaunchError::Spawn { .. })
        ));
    }

    #[test]
    fn runs_the_child_and_returns_its_code() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let code = run(&options(&["sh", "-c", "exit 7"], &lib)).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn child_stderr_goes_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let log = dir.path().join("child.log");
        let mut options = options(&["sh", "-c", "echo report >&2"], &lib);
        options.log = Some(log.clone());
        assert_eq!(run(&options).unwrap(), 0);
        assert!(fs::read_to_string(&log).unwrap().contains("report"));
    }

    #[test]
    fn duration_limit_stops_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let mut options = options(&["sleep", "30"], &lib);
        options.duration = Some(Duration::from_millis(200));

        let started = Instant::now();
        let code = run(&options).unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn fast_child_is_not_timed_out() {
        let mut child = Command::new("true").spawn().unwrap();
        let (status, timed_out) =
            wait_with_limit(&mut child, Some(Duration::from_secs(30))).unwrap();
        assert!(status.success());
        assert!(!timed_out);
    }

    #[test]
    fn profile_is_written_from_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let log = dir.path().join("child.log");
        let output = dir.path().join("profile.json");
        let script = "printf '%s\\n' 'hello' '=== MEMORY LEAK REPORT ===' \
            'Total allocated: 300 bytes (2 allocations)' \
            'Total freed: 100 bytes (1 frees)' \
            'Current usage: 200 bytes' 'Peak usage: 300 bytes' \
            '  LEAK: 200 bytes at 0xb0 (allocated at @0)' \
            '=========================' >&2; exit 3";
        let mut options = options(&["sh", "-c", script], &lib);
        options.log = Some(log.clone());
        options.output = Some(output.clone());

        assert_eq!(run(&options).unwrap(), 3);
        // the log still gets everything
        let logged = fs::read_to_string(&log).unwrap();
        assert!(logged.contains("hello\n=== MEMORY LEAK REPORT ===\n"));

        let profile: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(profile["command"], format!("sh -c {script}"));
        assert_eq!(profile["exit_code"], 3);
        assert_eq!(profile["memory_stats"]["total_allocated"], 300);
        assert_eq!(profile["leaks"][0]["address"], 0xb0);
        assert_eq!(profile["leak_summary"]["total_leaked_bytes"], 200);
        assert_eq!(profile["leak_summary"]["largest_leak"], 200);
    }

    #[test]
    fn profile_without_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let output = dir.path().join("profile.json");
        let mut options = options(&["true"], &lib);
        options.output = Some(output.clone());

        assert_eq!(run(&options).unwrap(), 0);
        let profile: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert!(profile["memory_stats"].is_null());
        assert_eq!(profile["leak_summary"]["leak_count"], 0);
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let lib = fake_library(dir.path());
        let err = run(&options(&["/nonexistent/program"], &lib)).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(err.to_string(), "failed to start /nonexistent/program");
    }
}
