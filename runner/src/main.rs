use clap::{ArgAction, Parser, Subcommand};
use mipsift_runner::{
    barrier::{sentinel_command, write_marker, Barrier, CancelToken},
    config::{ConfigErrors, PipelineConfig},
    executors::Executors,
    instances::collect_instances,
    phase::{PhaseContext, PhaseDirs},
    pipeline::{Pipeline, PipelineError},
    submit::Submitter,
    sweep::{read_hyperparameters, run_sweep, SweepDirs, SweepError},
    workspace::{clear_dir, WorkspaceError},
};
use nix::sys::signal::{SigSet, Signal};
use once_cell::sync::Lazy;
use std::{
    fs, io,
    path::PathBuf,
    process::{self, ExitCode},
    thread,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

static INTERRUPTED: Lazy<CancelToken> = Lazy::new(CancelToken::new);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Pipeline configuration (YAML)
    #[arg(short, long, global = true, default_value = "mipsift.yml")]
    config: PathBuf,

    /// Increase log verbosity, overridden by RUST_LOG
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Screen all instances and copy the selected ones into the subset directory
    Screen {
        #[arg(value_parser = existing_dir)]
        instance_dir: PathBuf,
        solution_dir: PathBuf,
        #[arg(value_parser = existing_dir)]
        instance_subset_dir: PathBuf,
        #[arg(value_parser = existing_dir)]
        outfiles_dir: PathBuf,
        #[arg(value_parser = existing_dir)]
        results_dir: PathBuf,
    },
    /// Run every instance with a hyperparameter configuration over all seeds
    Sweep {
        /// File with one `name: value` line per hyperparameter
        hyperparameters: PathBuf,
        #[arg(value_parser = existing_dir)]
        instance_dir: PathBuf,
        results_dir: PathBuf,
        outfiles_dir: PathBuf,
        /// Load `<instance>.<ext>` solutions from this directory
        #[arg(long)]
        solution_dir: Option<PathBuf>,
        /// Submit with the exclusive resource profile
        #[arg(long)]
        exclusive: bool,
    },
    /// Create a marker file, used as the sentinel job of a barrier
    Sentinel { marker: PathBuf },
    /// Remove the content of the given directories
    Clean {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

fn existing_dir(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);

    if path.is_dir() {
        Ok(path)
    } else {
        Err(format!("{value} is not a valid directory"))
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Route SIGINT and SIGTERM to `INTERRUPTED`, a second signal exits immediately.
/// Has to run before any other thread is started, the signals stay blocked everywhere else.
fn watch_interrupts() -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    thread::Builder::new()
        .name(String::from("signals"))
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) if INTERRUPTED.is_cancelled() => {
                    error!("Received {signal} again, exiting without cleanup");
                    process::exit(130);
                }
                Ok(signal) => {
                    warn!("Received {signal}, cancelling outstanding jobs");
                    INTERRUPTED.cancel();
                }
                Err(e) => {
                    error!("Failed to wait for signals: {e}");
                    return;
                }
            }
        })
        .map(|_| ())
}

fn load_config(path: &PathBuf) -> Result<PipelineConfig, ConfigErrors> {
    let mut config = PipelineConfig::load(path)?;

    if config.preflight_checks() {
        Err(ConfigErrors::PreflightFailed)
    } else {
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<(), CommandError> {
    match cli.command {
        Commands::Sentinel { marker } => Ok(write_marker(&marker)?),
        Commands::Clean { dirs } => {
            for dir in dirs {
                let removed = clear_dir(&dir)?;
                info!("Removed {removed} entries from {}", dir.display());
            }

            Ok(())
        }
        Commands::Screen {
            instance_dir,
            solution_dir,
            instance_subset_dir,
            outfiles_dir,
            results_dir,
        } => {
            let config = load_config(&cli.config)?;
            watch_interrupts().expect_or_log("Failed to watch for interrupts");
            fs::create_dir_all(&solution_dir)?;

            let submitter = Submitter::new(Executors::load(&config.scheduler)?, &config.scheduler, false);
            let barrier = Barrier::new(
                &submitter,
                &config.barrier,
                sentinel_command(&config.barrier)?,
                INTERRUPTED.clone(),
            );
            let dirs = PhaseDirs {
                results: results_dir,
                outfiles: outfiles_dir,
                solutions: solution_dir,
            };
            let context = PhaseContext {
                config: &config,
                submitter: &submitter,
                barrier: &barrier,
                dirs: &dirs,
            };

            let instances = collect_instances(&instance_dir, &config.screening.instance_glob)?;
            if instances.is_empty() {
                warn!("No instances found in {}", instance_dir.display());
            }

            let report = Pipeline::new(&context, instance_subset_dir).run(instances)?;
            for phase in report.phases {
                info!(
                    "{}: {} submitted, {} selected, {} without result, {} rejected",
                    phase.kind, phase.submitted, phase.survivors, phase.missing, phase.rejected
                );
            }

            Ok(())
        }
        Commands::Sweep {
            hyperparameters,
            instance_dir,
            results_dir,
            outfiles_dir,
            solution_dir,
            exclusive,
        } => {
            let config = load_config(&cli.config)?;
            let params = read_hyperparameters(&hyperparameters)?;
            watch_interrupts().expect_or_log("Failed to watch for interrupts");

            let submitter = Submitter::new(
                Executors::load(&config.scheduler)?,
                &config.scheduler,
                exclusive,
            );
            let barrier = Barrier::new(
                &submitter,
                &config.barrier,
                sentinel_command(&config.barrier)?,
                INTERRUPTED.clone(),
            );
            let dirs = SweepDirs {
                instances: instance_dir,
                solutions: solution_dir,
                results: results_dir,
                outfiles: outfiles_dir,
            };

            let report = run_sweep(&config, &submitter, &barrier, &dirs, &params)?;
            for (status, count) in report.statuses {
                info!("{status}: {count}");
            }

            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
