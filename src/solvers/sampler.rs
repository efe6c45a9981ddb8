use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Cluster, ClusterPair};
use crate::core::grid::Line;
use crate::core::units::EnergyUnit;
use crate::engine::evaluator::{self, EnergyMode, Evaluator, WorkerSession};
use crate::engine::operators::{sample_orientation, translate_along_axis, Pose};
use crate::error::ConfigError;

/// Slack on the `max_dis` comparison so that `start + k*sstep` landing on
/// `max_dis` up to rounding is still accepted.
const DISTANCE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Energy threshold in `unit`; a line starts at the first distance whose
    /// energy is below it.
    pub max_e: f64,
    pub unit: EnergyUnit,
    /// Maximum separation (Å).
    pub max_dis: f64,
    /// Maximum number of points per line.
    pub npoints: usize,
    /// Step between consecutive distances (Å).
    pub sstep: f64,
    pub start_distance: f64,
    pub mode: EnergyMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_e: 15_000.0,
            unit: EnergyUnit::Wavenumber,
            max_dis: 9.0,
            npoints: 10,
            sstep: 0.1,
            start_distance: 3.5,
            mode: EnergyMode::Counterpoise,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.npoints == 0 {
            return Err(ConfigError::invalid("npoints", "must be positive"));
        }
        if !(self.sstep.is_finite() && self.sstep > 0.0) {
            return Err(ConfigError::invalid("sstep", format!("{} is not a positive step", self.sstep)));
        }
        if !(self.start_distance.is_finite() && self.start_distance > 0.0) {
            return Err(ConfigError::invalid("start_distance", "must be positive"));
        }
        if !self.max_dis.is_finite() || self.max_dis < self.start_distance {
            return Err(ConfigError::invalid(
                "max_dis",
                format!("{} is below start_distance {}", self.max_dis, self.start_distance),
            ));
        }
        if !self.max_e.is_finite() {
            return Err(ConfigError::invalid("max_e", "must be finite"));
        }
        Ok(())
    }

    /// `max_e` in hartree, the unit the backends report.
    pub fn threshold_hartree(&self) -> f64 {
        self.unit.to_hartree(self.max_e)
    }

    /// Distance of step `k`, computed directly to avoid accumulated drift.
    fn distance_at(&self, k: usize) -> f64 {
        self.start_distance + k as f64 * self.sstep
    }

    fn within_range(&self, d: f64) -> bool {
        d <= self.max_dis + DISTANCE_EPS
    }
}

/// One backend call made while searching for the start of a line.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub distance: f64,
    /// Energy in hartree, or the backend failure.
    pub outcome: Result<f64, String>,
}

/// Result of sampling one line.
#[derive(Debug, Clone)]
pub struct LineSample {
    pub line: usize,
    pub pose: Pose,
    /// First accepted distance, `None` if the threshold was never met
    /// within `max_dis`.
    pub start: Option<f64>,
    pub distances: Vec<f64>,
    pub geometries: Vec<ClusterPair>,
    pub probes: Vec<Probe>,
}

impl LineSample {
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    pub fn into_line(self) -> Line {
        Line {
            distances: self.distances,
            geometries: self.geometries,
        }
    }
}

/// Adaptive sampler of one separation coordinate.
#[derive(Debug, Clone)]
pub struct LineSampler {
    config: SamplerConfig,
}

impl LineSampler {
    pub fn new(config: SamplerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Samples one line for a random orientation of `a` and `b`.
    ///
    /// Starting at `start_distance`, the second cluster is pushed outward in
    /// `sstep` increments until the energy drops below `max_e`. From there up
    /// to `npoints` consecutive distances no larger than `max_dis` form the
    /// line. A failed evaluation during the search is recorded and the search
    /// moves on to the next distance.
    pub fn sample_line<R: Rng + ?Sized>(
        &self,
        evaluator: &dyn Evaluator,
        session: &mut WorkerSession,
        a: &Cluster,
        b: &Cluster,
        rng: &mut R,
        line: usize,
    ) -> LineSample {
        let cfg = &self.config;
        let threshold = cfg.threshold_hartree();
        let pose = sample_orientation(a, b, rng);

        let mut probes = Vec::new();
        let mut start_step = None;
        let mut k = 0;
        loop {
            let d = cfg.distance_at(k);
            if !cfg.within_range(d) {
                break;
            }
            let pair = translate_along_axis(&pose, d);
            let tag = format!("probe_l{}_{}", line, k);
            match evaluator::evaluate_point(evaluator, session, &pair, &cfg.mode, &tag) {
                Ok(e) => {
                    debug!("line {}: E({:.3}) = {:.8} Eh", line, d, e);
                    probes.push(Probe {
                        distance: d,
                        outcome: Ok(e),
                    });
                    if e < threshold {
                        start_step = Some(k);
                        break;
                    }
                }
                Err(err) => {
                    warn!("line {}: evaluation at {:.3} failed: {}", line, d, err);
                    probes.push(Probe {
                        distance: d,
                        outcome: Err(err.to_string()),
                    });
                }
            }
            k += 1;
        }

        let mut distances = Vec::with_capacity(cfg.npoints);
        let mut geometries = Vec::with_capacity(cfg.npoints);
        if let Some(k0) = start_step {
            for j in 0..cfg.npoints {
                let d = cfg.distance_at(k0 + j);
                if !cfg.within_range(d) {
                    break;
                }
                geometries.push(translate_along_axis(&pose, d));
                distances.push(d);
            }
        } else {
            warn!(
                "line {}: energy stayed above {} {} up to {} Å, line is empty",
                line, cfg.max_e, cfg.unit, cfg.max_dis
            );
        }

        LineSample {
            line,
            pose,
            start: start_step.map(|k0| cfg.distance_at(k0)),
            distances,
            geometries,
            probes,
        }
    }
}
