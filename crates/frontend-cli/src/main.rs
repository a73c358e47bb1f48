//! mempin command-line driver.
//!
//! Replays a program trace under one profiling tool and writes the tool's
//! output to `<base>_<pid>`:
//!
//! ```text
//! mempin -tool 1 -o /tmp/run --trace program.json
//! mempin -tool 2 -o /tmp/run --trace program.json --archive
//! mempin --show /tmp/run_4242.mpz
//! ```
//!
//! Diagnostics go to stderr through `env_logger` (`RUST_LOG=info` shows tool
//! registration), never into the profile output.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use log::{error, info, warn};

use mempin_core::archive::load_archive;
use mempin_core::config::DEFAULT_OUTPUT;
use mempin_core::sim::Program;
use mempin_core::{Config, InstrumentationHost, OutputSink, ProfileError, Result, SimHost, ToolEnv, ToolRegistry};

const BANNER: &str = "MemPin - Memory and Instruction optimization tool";

#[derive(Parser, Debug)]
#[command(name = "mempin", version, about = BANNER)]
struct Args {
    /// Output file base name; the process id is appended
    #[arg(short = 'o', value_name = "PATH", default_value = DEFAULT_OUTPUT)]
    output: String,

    /// Analysis tool: 0 inscount, 1 inscount_ext, 2 proccount, 3 malloctrace
    #[arg(long = "tool", value_name = "ID", default_value_t = 0, allow_negative_numbers = true)]
    tool: i32,

    /// Program trace (JSON) to replay
    #[arg(long, value_name = "FILE", required_unless_present = "show")]
    trace: Option<PathBuf>,

    /// Also save a binary archive of the final report to `<base>_<pid>.mpz`
    #[arg(long)]
    archive: bool,

    /// Print a saved archive in its text format and exit
    #[arg(long, value_name = "ARCHIVE", conflicts_with = "trace")]
    show: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> Config {
        Config { output: self.output.clone(), tool: self.tool, archive: self.archive }
    }
}

/// Accept the single-dash `-tool` knob spelling, with or without `=`.
fn knob_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|a| match a.strip_prefix("-tool") {
            Some(rest) if rest.is_empty() || rest.starts_with('=') => format!("--tool{}", rest),
            _ => a,
        })
        .collect()
}

/// Print the argument error and usage summary. Returns the exit status.
fn usage(err: &clap::Error) -> i32 {
    eprintln!("{}", BANNER);
    eprintln!();
    eprintln!("{}", err);
    eprintln!("{}", Args::command().render_help());
    -1
}

/// Replay the trace under the selected tool.
fn run(args: &Args) -> Result<()> {
    let config = args.config();
    let Some(trace) = &args.trace else {
        return Err(ProfileError::Io(io::Error::new(io::ErrorKind::InvalidInput, "no trace given")));
    };
    let program = Program::from_json(&fs::read_to_string(trace)?)?;

    let mut host = SimHost::new(program.pid);
    let pid = host.pid();
    info!("starting mempin with tool {}", config.tool);

    let out_path = config.output_path(pid);
    let sink = Arc::new(OutputSink::create(&out_path)?);
    let mut env = ToolEnv::new(sink.clone());
    if config.archive {
        env = env.with_archive(config.archive_path(pid));
    }

    let registry = ToolRegistry::with_default_tools();
    let tool = registry.dispatch(config.tool, &mut host, &env)?;
    info!("{} active, writing {}", tool.name(), out_path.display());

    let code = host.run(&program)?;
    info!("profiled program exited with code {}", code);
    if !sink.is_healthy() {
        warn!("output {} may be incomplete", out_path.display());
    }
    Ok(())
}

fn show(path: &Path) -> Result<()> {
    let (tool, report) = load_archive(path)?;
    info!("{}: {} report", path.display(), tool.name());
    let stdout = io::stdout();
    let mut out = stdout.lock();
    report.render(&mut out)?;
    out.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match Args::try_parse_from(knob_args(std::env::args())) {
        Ok(args) => args,
        Err(e) => process::exit(usage(&e)),
    };

    if let Some(path) = &args.show {
        if let Err(e) = show(path) {
            eprintln!("mempin: {}", e);
            process::exit(1);
        }
        return;
    }

    if let Err(e) = run(&args) {
        error!("{}", e);
        eprintln!("mempin: {}", e);
        process::exit(1);
    }
}
