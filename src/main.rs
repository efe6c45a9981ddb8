use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use potcalc::config::RunConfig;
use potcalc::core::units::EnergyUnit;
use potcalc::engine::calculator::Calculator;
use potcalc::engine::evaluator::{clean_calculation_files, Evaluator};
use potcalc::interface::monitor::ProgressMonitor;
use potcalc::io::records::{self, RestartRecord};
use potcalc::solvers::coordinator::{self, Coordinator, CoordinatorConfig, RunOutcome};
use potcalc::solvers::plan;
use potcalc::solvers::{progress_channel, RunEvent};
use potcalc::Error;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Potential-energy surface sampling between two molecular clusters", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Threads used for line sampling (0 = all cores)
    #[arg(short, long, default_value_t = 0, global = true)]
    threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample the lines of a job and write the restart file, without computing points
    Sample {
        job: PathBuf,
        /// Restart file to write (defaults to the job's restart_path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sample the lines of a job and compute every point
    Run { job: PathBuf },
    /// Resume an interrupted calculation from its restart file
    Continue {
        restart: PathBuf,
        /// JSON calculator whose engine settings replace the stored ones
        /// (method and basis stay as stored)
        #[arg(short, long)]
        calculator: Option<PathBuf>,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Recompute the geometries of a save or restart file with another calculator
    Recompute {
        record: PathBuf,
        /// JSON file holding the new calculator
        #[arg(short, long)]
        calculator: PathBuf,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Energy of every frame of an xyz file
    XyzEnergies {
        xyz: PathBuf,
        #[arg(short, long)]
        calculator: PathBuf,
        /// Unit of the printed energies
        #[arg(short, long, default_value = "hartree")]
        unit: String,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Export the computed points of a save file as csv
    Export { save: PathBuf, csv: PathBuf },
    /// Remove leftover engine files of a basename
    Clean {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(short, long, default_value = "base")]
        basename: String,
    },
}

/// Coordinator settings for commands that do not read a job file.
#[derive(Args, Debug)]
struct RunnerArgs {
    /// Parallel engine invocations
    #[arg(short, long)]
    workers: Option<usize>,
    /// Completions between checkpoints (defaults to the number of workers)
    #[arg(long)]
    save_after: Option<usize>,
    #[arg(long)]
    restart: Option<PathBuf>,
    #[arg(long)]
    save: Option<PathBuf>,
    /// Directory for engine input and output files
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long)]
    basename: Option<String>,
    /// Timeout per point in seconds
    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    keep_files: bool,
}

impl RunnerArgs {
    fn into_config(self) -> Result<CoordinatorConfig> {
        let mut cfg = CoordinatorConfig::default();
        if let Some(w) = self.workers {
            cfg.workers = w;
        }
        cfg.save_after = self.save_after;
        cfg.restart_path = self.restart;
        cfg.save_path = self.save;
        if let Some(dir) = self.work_dir {
            cfg.sessions.work_dir = dir;
        }
        if let Some(name) = self.basename {
            cfg.sessions.basename = name;
        }
        if let Some(secs) = self.timeout {
            if !(secs.is_finite() && secs > 0.0) {
                bail!("timeout must be a positive number of seconds");
            }
            cfg.sessions.timeout = Some(Duration::from_secs_f64(secs));
        }
        cfg.sessions.keep_files = self.keep_files;
        Ok(cfg)
    }
}

// --- Initialization Helpers ---

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn load_calculator(path: &Path) -> Result<Calculator> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let calc: Calculator =
        serde_json::from_str(&text).with_context(|| format!("Invalid calculator in {}", path.display()))?;
    Ok(calc)
}

/// Runs `f` with a progress monitor attached and waits for the monitor.
fn monitored<F>(f: F) -> Result<RunOutcome, Error>
where
    F: FnOnce(Option<crossbeam_channel::Sender<RunEvent>>) -> Result<RunOutcome, Error>,
{
    let (tx, rx) = progress_channel(256);
    let monitor = ProgressMonitor::spawn(rx).map_err(Error::Worker)?;
    let result = f(Some(tx));
    monitor.join();
    result
}

/// A failed checkpoint must not lose the grid: try once more under another
/// file name.
fn rescue(err: Error) -> anyhow::Error {
    if let Error::Checkpoint { path, record, .. } = &err {
        let fallback = path.with_extension("rescue.json");
        match records::write_restart(&fallback, record) {
            Ok(()) => error!("In-memory state written to {}", fallback.display()),
            Err(e) => error!("Could not save the in-memory state anywhere: {}", e),
        }
    }
    anyhow::Error::new(err)
}

// --- Commands ---

fn sample(job: &Path) -> Result<(RunConfig, RestartRecord)> {
    let cfg = RunConfig::load(job).with_context(|| format!("Invalid job file {}", job.display()))?;
    let (first, second) = cfg.load_clusters()?;
    let evaluator: &dyn Evaluator = &cfg.calculator;
    let grid = plan::build_grid(evaluator, &first, &second, &cfg.plan, &cfg.coordinator.sessions)?;

    let counts = grid.counts();
    info!(
        "Grid: {} lines x {} slots, {} points to compute",
        grid.nlines(),
        grid.width(),
        counts.pending
    );
    let record = RestartRecord::new(
        cfg.calculator.clone(),
        first[0].clone(),
        second[0].clone(),
        Some(cfg.plan.clone()),
        grid,
    );
    Ok((cfg, record))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .context("Failed to configure the thread pool")?;
    }

    match cli.command {
        Command::Sample { job, output } => {
            let (cfg, record) = sample(&job)?;
            let path = output
                .or(cfg.coordinator.restart_path)
                .context("No output given and the job has no restart_path")?;
            records::write_restart(&path, &record)?;
            info!("Restart file written to {}", path.display());
        }

        Command::Run { job } => {
            let (cfg, record) = sample(&job)?;
            let evaluator: Arc<dyn Evaluator> = Arc::new(cfg.calculator.clone());
            let runner = Coordinator::new(evaluator, cfg.coordinator)?;
            monitored(|tx| runner.run(record, tx)).map_err(rescue)?;
        }

        Command::Continue {
            restart,
            calculator,
            runner,
        } => {
            let program = match calculator {
                Some(path) => {
                    let calc = load_calculator(&path)?;
                    info!(
                        "Using the engine settings of {}; method and basis come from {}",
                        path.display(),
                        restart.display()
                    );
                    Some(calc.program)
                }
                None => None,
            };
            let config = runner.into_config()?;
            monitored(|tx| coordinator::continue_calculation(&restart, program, config, tx))
                .map_err(rescue)?;
        }

        Command::Recompute {
            record,
            calculator,
            runner,
        } => {
            let calc = load_calculator(&calculator)?;
            let config = runner.into_config()?;
            if config.save_path.is_none() && config.restart_path.is_none() {
                warn!("Neither --save nor --restart given, results stay in memory only");
            }
            monitored(|tx| coordinator::calculate_potential(&record, calc, config, tx)).map_err(rescue)?;
        }

        Command::XyzEnergies {
            xyz,
            calculator,
            unit,
            runner,
        } => {
            let unit: EnergyUnit = unit.parse()?;
            let calc = load_calculator(&calculator)?;
            let config = runner.into_config()?;
            let energies = coordinator::calculate_energy_for_xyzfile(&xyz, calc, config, None)?;

            let stdout = io::stdout();
            let mut out = stdout.lock();
            for (i, e) in energies.iter().enumerate() {
                match e {
                    Ok(e) => writeln!(out, "{:>6} {:>22.12} {}", i, unit.from_hartree(*e), unit)?,
                    Err(reason) => writeln!(out, "{:>6} {:>22} # {}", i, "NaN", reason)?,
                }
            }
        }

        Command::Export { save, csv } => {
            let record = records::load_save(&save)?;
            record.write_csv(&csv)?;
            info!("{} points written to {}", record.points.len(), csv.display());
        }

        Command::Clean { dir, basename } => {
            let removed = clean_calculation_files(&dir, &basename)
                .with_context(|| format!("Failed to clean {}", dir.display()))?;
            info!("Removed {} files", removed);
        }
    }

    Ok(())
}
