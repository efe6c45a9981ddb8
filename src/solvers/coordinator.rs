use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::domain::{Cluster, ClusterPair};
use crate::core::grid::{Line, PointId, PointState, SamplingGrid};
use crate::engine::calculator::{Calculator, Program};
use crate::engine::evaluator::{self, EnergyMode, Evaluator, SessionSettings};
use crate::error::{ConfigError, Error, RecordError, Result};
use crate::io::records::{self, RecordFile, RestartRecord, SaveRecord};
use crate::io::xyz;
use crate::solvers::{ProgressEvent, RunEvent};

fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub workers: usize,
    /// Completions between two checkpoints. Defaults to `workers`.
    pub save_after: Option<usize>,
    pub restart_path: Option<PathBuf>,
    pub save_path: Option<PathBuf>,
    #[serde(flatten)]
    pub sessions: SessionSettings,
    pub mode: EnergyMode,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            save_after: None,
            restart_path: None,
            save_path: None,
            sessions: SessionSettings::default(),
            mode: EnergyMode::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn save_after(&self) -> usize {
        self.save_after.unwrap_or(self.workers)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be positive"));
        }
        if self.save_after == Some(0) {
            return Err(ConfigError::invalid("save_after", "must be positive"));
        }
        for (name, path) in [("restart_path", &self.restart_path), ("save_path", &self.save_path)] {
            if let Some(path) = path {
                check_parent(name, path)?;
            }
        }
        if !self.sessions.work_dir.is_dir() {
            return Err(ConfigError::invalid(
                "work_dir",
                format!("{} is not a directory", self.sessions.work_dir.display()),
            ));
        }
        if self.sessions.basename.is_empty() {
            return Err(ConfigError::invalid("basename", "must not be empty"));
        }
        Ok(())
    }
}

fn check_parent(name: &'static str, path: &Path) -> Result<(), ConfigError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Ok(()),
    };
    if parent.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            name,
            format!("directory {} does not exist", parent.display()),
        ))
    }
}

/// Stops dispatch of new points. Points already handed to a worker finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Applicable points in the grid.
    pub total: usize,
    pub previously_computed: usize,
    pub previously_failed: usize,
    /// Points this run dispatched.
    pub attempted: usize,
    pub computed: usize,
    pub failed: usize,
    pub failures: Vec<(PointId, String)>,
    pub checkpoints_written: usize,
    /// Points left pending because the run was cancelled.
    pub skipped: usize,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "Run finished: {} points, {} computed now, {} failed now, {} computed before, {} failed before",
            self.total, self.computed, self.failed, self.previously_computed, self.previously_failed
        );
        if self.skipped > 0 {
            warn!("{} points were not attempted and stay pending", self.skipped);
        }
        for (id, reason) in &self.failures {
            warn!("  {} failed: {}", id, reason);
        }
    }
}

pub struct RunOutcome {
    /// Final state of the calculation, mask included.
    pub record: RestartRecord,
    pub save: SaveRecord,
    pub summary: RunSummary,
}

/// Evaluates the pending points of a restart record on a pool of worker
/// threads.
///
/// A feeder thread pushes `(id, geometry)` jobs into a queue bounded by the
/// number of workers. Each worker owns a session, evaluates and sends
/// `(id, outcome)` back. Only this coordinator touches the grid.
pub struct Coordinator {
    evaluator: Arc<dyn Evaluator>,
    config: CoordinatorConfig,
    cancel: CancelToken,
}

impl Coordinator {
    pub fn new(evaluator: Arc<dyn Evaluator>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            evaluator,
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Loads a restart file and evaluates whatever is still pending.
    pub fn resume(&self, path: &Path, progress: Option<Sender<RunEvent>>) -> Result<RunOutcome> {
        let record = records::load_restart(path)?;
        self.run(record, progress)
    }

    pub fn run(&self, mut record: RestartRecord, progress: Option<Sender<RunEvent>>) -> Result<RunOutcome> {
        let cfg = &self.config;
        let save_after = cfg.save_after();
        let steps = evaluator::steps_per_point(&*self.evaluator, &cfg.mode);
        let emit = |event: RunEvent| {
            if let Some(tx) = &progress {
                let _ = tx.send(event);
            }
        };

        let before = record.grid.counts();
        let mut summary = RunSummary {
            total: before.total,
            previously_computed: before.computed,
            previously_failed: before.failed,
            ..RunSummary::default()
        };

        let jobs: Vec<(PointId, ClusterPair)> = record
            .grid
            .points()
            .iter()
            .filter(|p| p.state.is_pending())
            .filter_map(|p| p.geometry.clone().map(|g| (p.id, g)))
            .collect();
        let pending = jobs.len();

        let msg = format!(
            "{} of {} points pending ({} already computed, {} failed), {} workers, {} backend call(s) per point",
            pending, summary.total, before.computed, before.failed, cfg.workers, steps
        );
        info!("{}", msg);
        emit(RunEvent::Log(msg));

        let mut completed = 0;
        let mut checkpoint_error: Option<(PathBuf, RecordError)> = None;

        if pending > 0 {
            let (job_tx, job_rx) = bounded::<(PointId, ClusterPair)>(cfg.workers);
            let (result_tx, result_rx) = unbounded::<(PointId, Result<f64, String>)>();
            let evaluator = &self.evaluator;
            let cancel = &self.cancel;

            thread::scope(|s| -> Result<()> {
                s.spawn(move || {
                    for job in jobs {
                        if cancel.is_cancelled() || job_tx.send(job).is_err() {
                            break;
                        }
                    }
                });

                for worker in 0..cfg.workers {
                    let jobs = job_rx.clone();
                    let results = result_tx.clone();
                    thread::Builder::new()
                        .name(format!("worker-{worker}"))
                        .spawn_scoped(s, move || {
                            let mut session = cfg.sessions.open(worker);
                            for (id, pair) in jobs.iter() {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                let tag = id.to_string();
                                let outcome = evaluator::evaluate_point(
                                    &**evaluator,
                                    &mut session,
                                    &pair,
                                    &cfg.mode,
                                    &tag,
                                )
                                .map_err(|e| e.to_string());
                                if results.send((id, outcome)).is_err() {
                                    break;
                                }
                            }
                            debug!("worker {} done after {} backend calls", worker, session.evaluations);
                        })
                        .map_err(|e| {
                            cancel.cancel();
                            Error::Worker(e)
                        })?;
                }
                drop(job_rx);
                drop(result_tx);

                // Ends once every worker has hung up.
                for (id, outcome) in result_rx.iter() {
                    let failure = outcome.as_ref().err().map(|reason| (id, reason.clone()));
                    match &outcome {
                        Ok(e) => debug!("{} computed: {:.10} Eh", id, e),
                        Err(reason) => warn!("{} failed: {}", id, reason),
                    }
                    if let Err(e) = record.grid.record(id, outcome) {
                        cancel.cancel();
                        return Err(e.into());
                    }
                    completed += 1;
                    match &failure {
                        Some(f) => {
                            summary.failed += 1;
                            summary.failures.push(f.clone());
                        }
                        None => summary.computed += 1,
                    }

                    emit(RunEvent::Progress(ProgressEvent {
                        completed,
                        total: pending,
                        steps_per_point: steps,
                        last_failure: failure,
                    }));

                    if completed % save_after != 0 || checkpoint_error.is_some() {
                        continue;
                    }
                    if let Some(path) = &cfg.restart_path {
                        match records::write_restart(path, &record) {
                            Ok(()) => {
                                summary.checkpoints_written += 1;
                                debug!("checkpoint after {} completions: {}", completed, path.display());
                                emit(RunEvent::CheckpointWritten {
                                    completed,
                                    path: path.clone(),
                                });
                            }
                            Err(e) => {
                                warn!("checkpoint to {} failed, stopping dispatch: {}", path.display(), e);
                                cancel.cancel();
                                checkpoint_error = Some((path.clone(), e));
                            }
                        }
                    }
                }
                Ok(())
            })?;
        }

        summary.attempted = completed;
        summary.skipped = pending - completed;

        if let Some((path, source)) = checkpoint_error {
            return Err(Error::Checkpoint {
                path,
                source,
                record: Box::new(record),
            });
        }

        // A cancelled run is not finished: only the restart record can hold
        // the points it left pending.
        let cancelled = summary.skipped > 0;
        let save = record.to_save();
        let save_path = cfg.save_path.as_ref().filter(|_| !cancelled);
        if let Some(path) = save_path {
            if let Err(source) = records::write_save(path, &save) {
                return Err(final_write_failed(path, source, record));
            }
            info!("Saved {} computed points to {}", save.points.len(), path.display());
        } else if let Some(path) = &cfg.restart_path {
            if let Err(source) = records::write_restart(path, &record) {
                return Err(final_write_failed(path, source, record));
            }
            info!("Final state written to {}", path.display());
        } else if cancelled {
            warn!("Run cancelled without a restart path, pending points are not on disk");
        }

        summary.log();
        emit(RunEvent::Finished(summary.clone()));

        Ok(RunOutcome {
            record,
            save,
            summary,
        })
    }
}

fn final_write_failed(path: &Path, source: RecordError, record: RestartRecord) -> Error {
    warn!("final write to {} failed: {}", path.display(), source);
    Error::Checkpoint {
        path: path.to_path_buf(),
        source,
        record: Box::new(record),
    }
}

/// Resumes the restart file at `path`.
///
/// `program` replaces the engine settings stored in the file (executable,
/// cores, memory), for example when resuming on another machine. Method and
/// basis are kept, and the engine itself cannot change mid-run.
/// Checkpoints go back to `path` unless another restart path is configured.
pub fn continue_calculation(
    path: &Path,
    program: Option<Program>,
    mut config: CoordinatorConfig,
    progress: Option<Sender<RunEvent>>,
) -> Result<RunOutcome> {
    let mut record = records::load_restart(path)?;
    if let Some(program) = program {
        if std::mem::discriminant(&program) != std::mem::discriminant(&record.calculator.program) {
            return Err(ConfigError::invalid(
                "program",
                format!(
                    "{} was started with {}, recompute it to change the engine",
                    path.display(),
                    record.calculator.name()
                ),
            )
            .into());
        }
        debug!("Engine settings of {} replaced", path.display());
        record.calculator.program = program;
    }
    record.calculator.validate()?;
    if config.restart_path.is_none() {
        config.restart_path = Some(path.to_path_buf());
    }
    info!(
        "Continuing {} (run {}) with {}",
        path.display(),
        record.run_id,
        record.calculator.name()
    );
    let evaluator: Arc<dyn Evaluator> = Arc::new(record.calculator.clone());
    Coordinator::new(evaluator, config)?.run(record, progress)
}

/// Recomputes the geometries of a save or restart file with `calculator`.
pub fn calculate_potential(
    path: &Path,
    calculator: Calculator,
    config: CoordinatorConfig,
    progress: Option<Sender<RunEvent>>,
) -> Result<RunOutcome> {
    calculator.validate()?;
    let record = match records::load_record(path)? {
        RecordFile::Restart(r) => r.recalculate_with(calculator.clone()),
        RecordFile::Save(s) => RestartRecord::from_save(s, calculator.clone()),
    };
    info!(
        "Recomputing {} geometries from {} with {} {}/{}",
        record.grid.counts().pending,
        path.display(),
        calculator.name(),
        calculator.method,
        calculator.basis
    );
    let evaluator: Arc<dyn Evaluator> = Arc::new(calculator);
    Coordinator::new(evaluator, config)?.run(record, progress)
}

/// Grid holding every frame as one slot of a single line.
pub fn frames_grid(frames: &[Cluster]) -> SamplingGrid {
    let line = Line {
        distances: vec![0.0; frames.len()],
        geometries: frames
            .iter()
            .map(|f| ClusterPair::new(f.clone(), Cluster::new(Vec::new())))
            .collect(),
    };
    SamplingGrid::from_lines(vec![line])
}

/// Plain energy of every frame of an xyz trajectory, in frame order.
pub fn calculate_energy_for_xyzfile(
    path: &Path,
    calculator: Calculator,
    mut config: CoordinatorConfig,
    progress: Option<Sender<RunEvent>>,
) -> Result<Vec<Result<f64, String>>> {
    calculator.validate()?;
    let frames = xyz::read_xyz(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let first = frames
        .first()
        .cloned()
        .ok_or_else(|| ConfigError::Other(format!("{} holds no frames", path.display())))?;
    info!("Computing energies of {} frames from {}", frames.len(), path.display());

    config.mode = EnergyMode::Total { ghost: Vec::new() };
    let record = RestartRecord::new(
        calculator.clone(),
        first,
        Cluster::new(Vec::new()),
        None,
        frames_grid(&frames),
    );
    let evaluator: Arc<dyn Evaluator> = Arc::new(calculator);
    let outcome = Coordinator::new(evaluator, config)?.run(record, progress)?;

    Ok(outcome
        .record
        .grid
        .line(0)
        .iter()
        .map(|p| match &p.state {
            PointState::Computed(e) => Ok(*e),
            PointState::Failed(reason) => Err(reason.clone()),
            other => Err(format!("not computed ({})", other.name())),
        })
        .collect())
}
