use std::{ffi::OsString, fs, path::PathBuf, process, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::{Builder, Env};
use log::{error, info};

mod launch;
mod profile;
mod scan;

use launch::LaunchOptions;
use scan::Format;

/// Heap allocation tracking for C and C++ programs
#[derive(Parser, Debug)]
#[command(name = "memtrack", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program with the tracker preloaded and report its leaks
    Run(RunArgs),
    /// Look for unmatched allocations in C/C++ sources
    Scan(ScanArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// The tracker library to preload
    #[arg(long, env = "MEMTRACK_LIB")]
    preload: Option<PathBuf>,

    /// Write the child's stderr (and so the leak report) to FILE
    #[arg(short, long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Print every tracked allocation and free
    #[arg(short, long)]
    verbose: bool,

    /// Preload the library but leave tracking off
    #[arg(long)]
    disable: bool,

    /// Stop the program after this many seconds
    #[arg(short, long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Write a JSON profile (timings, statistics and leak summary) to FILE
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// The program to run, and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// A source file, or a directory to search for sources
    path: PathBuf,

    /// Write the report to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

fn run(args: RunArgs) -> Result<i32> {
    let options = LaunchOptions {
        preload: args.preload,
        log: args.log,
        verbose: args.verbose,
        disable: args.disable,
        duration: args.duration.map(Duration::from_secs),
        output: args.output,
        command: args.command,
    };
    Ok(launch::run(&options)?)
}

fn scan(args: ScanArgs) -> Result<i32> {
    let analysis = scan::scan_path(&args.path)?;
    let report = scan::render(&analysis, args.format)?;
    match &args.output {
        Some(path) => {
            fs::write(path, report)
                .with_context(|| format!("could not write report to {}", path.display()))?;
            info!("Report saved to: {}", path.display());
        }
        None => print!("{report}"),
    }
    Ok(0)
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_module_path(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Scan(args) => scan(args),
    };
    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{err:#}");
            process::exit(1);
        }
    }
}
