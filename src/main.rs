//! rtlog - live view of running jobs' output
//!
//! A job writes `<prefix>.stdout` and `<prefix>.stderr` and is registered in
//! `~/.ipython-rtlogging.json`. rtlog lists registered jobs and follows the
//! two files of the selected one side by side, surviving truncation, rotation
//! and files that do not exist yet.
//!
//! # Quick Start
//!
//! ```text
//! rtlog run --name train -- python train.py   # Run and capture a job
//! rtlog                                       # Pick a job and watch it
//! rtlog watch -1                              # Watch the newest job
//! rtlog ls                                    # List jobs
//! rtlog load --name train --top -20           # Print the last 20 lines
//! rtlog rm --name train                       # Forget a job
//! ```
//!
//! # Keys in the live view
//!
//! | Key | Action |
//! |-----|--------|
//! | q / Esc / Ctrl+C | Stop watching |
//!
//! When stdout is not a terminal (or with `watch --plain`) lines are printed
//! as `[STDOUT] text` instead; enter `q`, close stdin or press Ctrl+C to stop.

mod config;
mod core;
mod registry;
mod tee;
mod ui;

use std::env;
use std::fs::OpenOptions;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Command as ChildCommand;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{ColorScheme, Config};
use crate::core::{
    DisplaySnapshot, LineEvent, MultiTailCoordinator, RingDisplayBuffer, SessionOutcome, ShutdownReport,
    StopTrigger, WorkerState,
};
use crate::registry::{parse_selection, Job, JobEntry, JobFiles, JobRegistry};
use crate::tee::{Buffering, CaptureOptions};
use crate::ui::{LiveView, Renderer, StatusLine};

const NOT_UPDATED: &str = "The program progress has not been updated. Please try again later.";
const NO_JOBS: &str = "No running jobs.";

#[derive(Parser, Debug)]
#[command(name = "rtlog", version, about = "Real-time view of running jobs' stdout and stderr")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// List registered jobs and exit
    #[arg(short, long)]
    list: bool,

    /// Job registry file
    #[arg(long, value_name = "PATH", global = true)]
    registry: Option<PathBuf>,

    /// Poll interval of the tail workers
    #[arg(long, value_name = "MS", global = true)]
    interval_ms: Option<u64>,

    /// Lines kept per stream in the live view
    #[arg(long, value_name = "N", global = true)]
    lines: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered jobs
    Ls,
    /// Watch a job by index (negative counts from the newest)
    Watch {
        #[arg(allow_negative_numbers = true)]
        index: isize,
        /// Print lines instead of the full-screen view
        #[arg(long)]
        plain: bool,
    },
    /// Run a command and capture its output into job files
    Run {
        /// Output prefix; files are NAME.stdout and NAME.stderr
        #[arg(long, default_value = "output")]
        name: String,
        /// 1 for line buffering, >1 for a block size, -1 or 0 to write through
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        buffering: i64,
        /// Leave stdout uncaptured
        #[arg(long)]
        no_stdout: bool,
        /// Leave stderr uncaptured
        #[arg(long)]
        no_stderr: bool,
        #[arg(last = true, required = true, value_name = "CMD")]
        command: Vec<String>,
    },
    /// Print a job's code and output (every job without --name)
    Load {
        #[arg(long)]
        name: Option<String>,
        /// First N lines, or the last N when negative
        #[arg(long, allow_negative_numbers = true)]
        top: Option<i64>,
    },
    /// Delete a job's files and registry entry (every job without --name)
    Rm {
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, config_error) = Config::load();
    if let Some(ms) = cli.interval_ms {
        config.tail.poll_interval_ms = ms;
    }
    if let Some(lines) = cli.lines {
        config.display.lines = lines;
    }

    init_logging(&config);
    info!("rtlog {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(error) = config_error {
        warn!(%error, "using default configuration");
        eprintln!("rtlog: {}; using defaults", error);
    }

    let registry_path = cli
        .registry
        .clone()
        .or_else(|| config.registry_path())
        .context("Cannot locate the job registry (no home directory)")?;
    let mut registry = JobRegistry::load(&registry_path)?;
    info!(registry = %registry.path().display(), jobs = registry.len(), "registry loaded");

    let command = match cli.command {
        Some(command) => command,
        None if cli.list => Command::Ls,
        None => return watch(&config, &registry, None, false),
    };

    match command {
        Command::Ls => list(&config, &registry),
        Command::Watch { index, plain } => watch(&config, &registry, Some(index), plain),
        Command::Run {
            name,
            buffering,
            no_stdout,
            no_stderr,
            command,
        } => {
            let options = CaptureOptions {
                stdout: !no_stdout,
                stderr: !no_stderr,
                buffering: Buffering::from_arg(buffering),
            };
            let code = run_job(&mut registry, &name, options, &command)?;
            std::process::exit(code);
        }
        Command::Load { name, top } => load(&registry, name.as_deref(), top),
        Command::Rm { name } => remove(&mut registry, name.as_deref()),
    }
}

/// Log to `~/.rtlog/rtlog.log`; the terminal belongs to the live view
fn init_logging(config: &Config) {
    let log_path = Config::rtlog_dir()
        .map(|dir| dir.join("rtlog.log"))
        .unwrap_or_else(|| PathBuf::from("rtlog.log"));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("RTLOG_LOG")
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn list(config: &Config, registry: &JobRegistry) -> anyhow::Result<()> {
    if registry.is_empty() {
        println!("{}", NO_JOBS);
        return Ok(());
    }
    ui::print_jobs(&mut io::stdout().lock(), registry.jobs(), &config.get_color_scheme())?;
    Ok(())
}

fn watch(config: &Config, registry: &JobRegistry, index: Option<isize>, plain: bool) -> anyhow::Result<()> {
    if registry.is_empty() {
        println!("{}", NO_JOBS);
        return Ok(());
    }
    let scheme = config.get_color_scheme();

    let job = match index {
        Some(index) => registry
            .get(index)
            .with_context(|| format!("No job at index {} ({} registered)", index, registry.len()))?
            .clone(),
        None => {
            ui::print_jobs(&mut io::stdout().lock(), registry.jobs(), &scheme)?;
            prompt_selection(registry)?
        }
    };

    if config.display.show_code {
        ui::print_code(&mut io::stdout().lock(), &job, &scheme)?;
    }

    if job.files().is_pending() {
        info!(job = %job.prefix.display(), "no output yet");
        println!("{}", NOT_UPDATED);
        return Ok(());
    }

    if plain || !io::stdout().is_terminal() {
        plain_view(config, &job)
    } else {
        live_view(config, &job, scheme)
    }
}

/// Ask for an index until a valid one is given
fn prompt_selection(registry: &JobRegistry) -> anyhow::Result<Job> {
    let stdin = io::stdin();
    let mut input = String::new();
    loop {
        print!("Select Index (None means -1): ");
        io::stdout().flush()?;

        input.clear();
        if stdin.lock().read_line(&mut input)? == 0 {
            bail!("No job selected");
        }
        match parse_selection(&input, registry.len()) {
            Some(index) => return Ok(registry.jobs()[index].clone()),
            None => println!("Invalid input. Please enter a valid index."),
        }
    }
}

fn live_view(config: &Config, job: &Job, scheme: ColorScheme) -> anyhow::Result<()> {
    // Workers only drop the newest snapshot here; drawing happens on the UI thread
    let latest: Arc<Mutex<Option<DisplaySnapshot>>> = Arc::new(Mutex::new(None));
    let slot = latest.clone();
    let buffer = RingDisplayBuffer::paired(config.display_lines()).with_render_callback(Box::new(
        move |snapshot: &DisplaySnapshot| {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(snapshot.clone());
        },
    ));
    let initial = buffer.snapshot();

    let mut coordinator = MultiTailCoordinator::start(
        job.files().sources(),
        Arc::new(Mutex::new(buffer)),
        config.tail_options(),
    )
    .context("Failed to start tail workers")?;
    info!(job = %job.prefix.display(), "watching");

    let mut renderer = Renderer::with_color_scheme(scheme);
    renderer.init().context("Failed to initialize terminal")?;
    let result = run_live_loop(config, job, &mut coordinator, &mut renderer, &latest, initial);

    let report = coordinator.stop();
    renderer.cleanup()?;
    result?;

    print_failures(&report);
    info!(clean = report.is_clean(), "stopped watching");
    Ok(())
}

/// Stream tagged lines to stdout until `q` is entered, stdin closes or
/// Ctrl+C is pressed
fn plain_view(config: &Config, job: &Job) -> anyhow::Result<()> {
    let sink = Arc::new(|event: LineEvent| {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "[{}] {}", event.tag.label(), event.text);
        let _ = out.flush();
    });
    let mut coordinator = MultiTailCoordinator::start(job.files().sources(), sink, config.tail_options())
        .context("Failed to start tail workers")?;
    info!(job = %job.prefix.display(), "following in plain mode");

    stop_on_interrupt(coordinator.trigger())?;

    let trigger = coordinator.trigger();
    // Detached: it may stay blocked on stdin after the workers are gone
    thread::Builder::new()
        .name("rtlog-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "q" => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            request_stop(&trigger);
        })
        .context("Failed to watch stdin")?;

    let report = coordinator.wait();
    print_failures(&report);
    Ok(())
}

/// Ctrl+C stops the workers instead of killing the process
fn stop_on_interrupt(trigger: StopTrigger) -> anyhow::Result<()> {
    ctrlc::set_handler(move || request_stop(&trigger)).context("Failed to install the Ctrl+C handler")
}

fn print_failures(report: &ShutdownReport) {
    for failure in report.failures() {
        eprintln!(
            "{} ({}) {}",
            failure.tag.label(),
            failure.path.display(),
            failure.outcome
        );
    }
}

fn run_live_loop(
    config: &Config,
    job: &Job,
    coordinator: &mut MultiTailCoordinator,
    renderer: &mut Renderer,
    latest: &Mutex<Option<DisplaySnapshot>>,
    initial: DisplaySnapshot,
) -> anyhow::Result<()> {
    let trigger = coordinator.trigger();
    let name = job.name();
    let code = config.display.show_code.then_some(job.entry.code.as_str());
    let refresh = config.refresh_interval();
    let mut snapshot = initial;

    loop {
        if let Some(newer) = latest.lock().unwrap_or_else(|e| e.into_inner()).take() {
            snapshot = newer;
        }
        let status = status_line(coordinator);
        renderer.render(&LiveView {
            job: &name,
            code,
            snapshot: &snapshot,
            status: &status,
        })?;

        if coordinator.is_stopping() {
            break;
        }

        if event::poll(refresh)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && is_quit_key(key.code, key.modifiers) {
                    request_stop(&trigger);
                }
            }
        }
    }
    Ok(())
}

fn is_quit_key(code: KeyCode, modifiers: KeyModifiers) -> bool {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

fn request_stop(trigger: &StopTrigger) {
    if trigger.fire() {
        info!("stop requested");
    }
}

fn status_line(coordinator: &mut MultiTailCoordinator) -> StatusLine {
    let states = coordinator.status();
    let running = states
        .iter()
        .filter(|(_, state)| *state == WorkerState::Running)
        .count();
    let failed: Vec<String> = states
        .iter()
        .filter_map(|(tag, state)| match state {
            WorkerState::Finished(outcome) if *outcome != SessionOutcome::Cancelled => {
                Some(format!("{} {}", tag.label(), outcome))
            }
            _ => None,
        })
        .collect();

    let mut text = format!("{} running | {} open", running, coordinator.open_handles());
    if !failed.is_empty() {
        text.push_str(" | ");
        text.push_str(&failed.join(", "));
    }
    StatusLine {
        text,
        error: !failed.is_empty(),
    }
}

/// Run `command` with its output captured, returning its exit code
fn run_job(
    registry: &mut JobRegistry,
    name: &str,
    options: CaptureOptions,
    command: &[String],
) -> anyhow::Result<i32> {
    let (program, args) = command.split_first().context("No command given")?;

    let prefix = absolute(Path::new(name))?;
    let files = JobFiles::for_prefix(&prefix);
    registry.record(
        &prefix,
        JobEntry {
            code: tee::command_line(command),
            start_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        },
    );
    registry.save()?;
    info!(job = %prefix.display(), program = %program, "running");

    let mut child = ChildCommand::new(program);
    child.args(args);
    let (mut child, guard) = tee::spawn_captured(&mut child, &files, options)
        .with_context(|| format!("Failed to run {}", program))?;
    let status = child.wait().context("Failed to wait for the command")?;
    guard.finish().context("Failed to capture output")?;

    info!(job = %prefix.display(), %status, "finished");
    Ok(status.code().unwrap_or(1))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(env::current_dir()
        .context("Cannot resolve the current directory")?
        .join(path))
}

fn load(registry: &JobRegistry, name: Option<&str>, top: Option<i64>) -> anyhow::Result<()> {
    let jobs: Vec<&Job> = match name {
        Some(name) => vec![registry
            .find(name)
            .with_context(|| format!("No job named {}", name))?],
        None => registry.jobs().iter().collect(),
    };
    if jobs.is_empty() {
        println!("{}", NO_JOBS);
        return Ok(());
    }

    let mut out = io::stdout().lock();
    for job in jobs {
        ui::dump_job(&mut out, job, top)?;
    }
    Ok(())
}

fn remove(registry: &mut JobRegistry, name: Option<&str>) -> anyhow::Result<()> {
    let removed = match name {
        Some(name) => vec![registry.remove(name)?],
        None => registry.clear(),
    };

    for job in &removed {
        if let Err(e) = job.files().remove() {
            warn!(job = %job.prefix.display(), error = %e, "cannot delete job files");
            eprintln!("Cannot delete files of {}: {}", job.prefix.display(), e);
        }
        info!(job = %job.prefix.display(), "removed");
        println!("Removed {}", job.prefix.display());
    }
    registry.save()?;
    Ok(())
}
