use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::domain::{Cluster, ClusterPair};
use crate::error::BackendError;

/// How the energy of one two-cluster geometry is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMode {
    /// Plain energy of the combined geometry. Atoms listed in `ghost`
    /// (combined-cluster indices) only contribute basis functions.
    Total {
        #[serde(default)]
        ghost: Vec<usize>,
    },
    /// Counterpoise (BSSE) corrected interaction energy.
    Counterpoise,
}

impl Default for EnergyMode {
    fn default() -> Self {
        EnergyMode::Counterpoise
    }
}

/// Per-worker state, created once per worker lifetime and handed by
/// reference into every evaluation. Nothing about a backend is global.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub worker: usize,
    pub work_dir: PathBuf,
    pub basename: String,
    /// Upper bound for one point, shared by all its backend invocations.
    pub timeout: Option<Duration>,
    pub keep_files: bool,
    /// Backend invocations made through this session.
    pub evaluations: u64,
    /// End of the budget of the point being evaluated.
    deadline: Option<Instant>,
}

impl WorkerSession {
    pub fn new(worker: usize, work_dir: impl Into<PathBuf>, basename: &str) -> Self {
        Self {
            worker,
            work_dir: work_dir.into(),
            basename: basename.to_string(),
            timeout: None,
            keep_files: false,
            evaluations: 0,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    /// Bound for the next backend invocation: what is left of the current
    /// point's budget, or the plain timeout outside of [`evaluate_point`].
    /// Fails once the budget is spent.
    ///
    /// Evaluators that block must stay within this bound.
    pub fn invocation_timeout(&self) -> Result<Option<Duration>, BackendError> {
        let (Some(deadline), Some(limit)) = (self.deadline, self.timeout) else {
            return Ok(self.timeout);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(BackendError::Timeout(limit))
        } else {
            Ok(Some(left))
        }
    }

    /// Stem for the temporary files of one evaluation. Worker and point tag
    /// keep concurrent evaluations in a shared directory apart.
    pub fn file_stem(&self, tag: &str) -> String {
        format!("{}_w{}_{}", self.basename, self.worker, tag)
    }

    pub fn path_for(&self, stem: &str, ext: &str) -> PathBuf {
        self.work_dir.join(format!("{stem}.{ext}"))
    }

    /// Removes every file produced for `stem`, unless files are kept.
    pub fn clean(&self, stem: &str) {
        if self.keep_files {
            return;
        }
        let prefix = format!("{stem}.");
        if let Ok(entries) = fs::read_dir(&self.work_dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

/// Everything needed to open a [`WorkerSession`] for any worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub work_dir: PathBuf,
    pub basename: String,
    #[serde(with = "optional_secs")]
    pub timeout: Option<Duration>,
    pub keep_files: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            basename: "base".to_string(),
            timeout: None,
            keep_files: false,
        }
    }
}

impl SessionSettings {
    pub fn open(&self, worker: usize) -> WorkerSession {
        WorkerSession::new(worker, &self.work_dir, &self.basename)
            .with_timeout(self.timeout)
            .keep_files(self.keep_files)
    }
}

/// `Option<Duration>` as fractional seconds.
mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!("invalid timeout {s}"))),
            None => Ok(None),
        }
    }
}

/// Deletes the files left behind by calculations that used `basename`.
pub fn clean_calculation_files(dir: &Path, basename: &str) -> std::io::Result<usize> {
    let prefix = format!("{basename}_");
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// A generic interface for quantum-chemistry engines.
/// Implementations must be Thread-Safe (Sync): one instance is shared by
/// every worker, per-worker state lives in the [`WorkerSession`].
pub trait Evaluator: Send + Sync {
    /// Returns the name of the engine (e.g., "ORCA").
    fn name(&self) -> &str;

    /// Backend invocations needed for one counterpoise-corrected energy:
    /// 1 when the engine does the correction itself, 3 otherwise.
    fn correction_steps(&self) -> usize {
        3
    }

    /// Energy (hartree) of `geometry`; atoms in `ghost` are ghost atoms.
    fn energy(
        &self,
        session: &mut WorkerSession,
        geometry: &Cluster,
        ghost: &[usize],
        tag: &str,
    ) -> Result<f64, BackendError>;

    /// E(AB) - E(A in AB basis) - E(B in AB basis).
    fn counterpoise_energy(
        &self,
        session: &mut WorkerSession,
        pair: &ClusterPair,
        tag: &str,
    ) -> Result<f64, BackendError> {
        ghost_counterpoise(self, session, pair, tag)
    }
}

/// Counterpoise correction from three plain evaluations with ghost atoms,
/// for engines that cannot do it in one call.
pub fn ghost_counterpoise<E: Evaluator + ?Sized>(
    evaluator: &E,
    session: &mut WorkerSession,
    pair: &ClusterPair,
    tag: &str,
) -> Result<f64, BackendError> {
    let combined = pair.combined();
    let split = pair.split_index();
    let ghost_second: Vec<usize> = (split..combined.len()).collect();
    let ghost_first: Vec<usize> = (0..split).collect();

    session.invocation_timeout()?;
    let e_ab = evaluator.energy(session, &combined, &[], &format!("{tag}_ab"))?;
    session.invocation_timeout()?;
    let e_a = evaluator.energy(session, &combined, &ghost_second, &format!("{tag}_a"))?;
    session.invocation_timeout()?;
    let e_b = evaluator.energy(session, &combined, &ghost_first, &format!("{tag}_b"))?;
    Ok(e_ab - e_a - e_b)
}

/// Evaluates one geometry in the requested mode.
pub fn evaluate(
    evaluator: &dyn Evaluator,
    session: &mut WorkerSession,
    pair: &ClusterPair,
    mode: &EnergyMode,
    tag: &str,
) -> Result<f64, BackendError> {
    match mode {
        EnergyMode::Total { ghost } => evaluator.energy(session, &pair.combined(), ghost, tag),
        EnergyMode::Counterpoise => evaluator.counterpoise_energy(session, pair, tag),
    }
}

/// [`evaluate`] under the session timeout, which then bounds the whole point
/// rather than each backend invocation. An overrun is a timeout even when
/// the backend returned an energy.
pub fn evaluate_point(
    evaluator: &dyn Evaluator,
    session: &mut WorkerSession,
    pair: &ClusterPair,
    mode: &EnergyMode,
    tag: &str,
) -> Result<f64, BackendError> {
    let Some(limit) = session.timeout else {
        return evaluate(evaluator, session, pair, mode, tag);
    };
    let started = Instant::now();
    session.deadline = Some(started + limit);
    let result = evaluate(evaluator, session, pair, mode, tag);
    session.deadline = None;

    match result {
        Err(BackendError::Timeout(_)) => Err(BackendError::Timeout(limit)),
        Ok(_) if started.elapsed() > limit => Err(BackendError::Timeout(limit)),
        other => other,
    }
}

/// Backend invocations made per point in `mode`.
pub fn steps_per_point(evaluator: &dyn Evaluator, mode: &EnergyMode) -> usize {
    match mode {
        EnergyMode::Total { .. } => 1,
        EnergyMode::Counterpoise => evaluator.correction_steps(),
    }
}
