//! Job files.
//!
//! A job is one JSON document naming the calculator, the two input
//! structures (xyz files, possibly trajectories), the sampling plan and the
//! coordinator settings:
//!
//! ```json
//! {
//!   "calculator": { "method": "MP2", "basis": "aug-cc-pVDZ",
//!                   "program": { "program": "orca", "ncore": 1 } },
//!   "cluster1": "water.xyz",
//!   "cluster2": "argon.xyz",
//!   "plan": { "nsamples": 4, "nlines": 2,
//!             "sampler": { "max_e": 15000, "unit": "cm-1" } },
//!   "coordinator": { "workers": 4, "restart_path": "run.restart.json",
//!                    "save_path": "run.save.json" }
//! }
//! ```
//!
//! Relative paths are taken relative to the job file.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::domain::Cluster;
use crate::engine::calculator::Calculator;
use crate::error::{ConfigError, RecordError};
use crate::io::xyz;
use crate::solvers::coordinator::CoordinatorConfig;
use crate::solvers::plan::PlanConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub calculator: Calculator,
    pub cluster1: PathBuf,
    pub cluster2: PathBuf,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl RunConfig {
    /// Reads and validates a job file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Other(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: RunConfig = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Other(format!("{}: {}", path.display(), e)))?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.cluster1);
        fix(&mut self.cluster2);
        fix(&mut self.coordinator.sessions.work_dir);
        if let Some(p) = self.coordinator.restart_path.as_mut() {
            fix(p);
        }
        if let Some(p) = self.coordinator.save_path.as_mut() {
            fix(p);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.calculator.validate()?;
        self.plan.validate()?;
        self.coordinator.validate()?;
        if self.plan.sampler.mode != self.coordinator.mode {
            warn!("line search and point evaluation use different energy modes");
        }
        Ok(())
    }

    /// Frames of both input files.
    pub fn load_clusters(&self) -> Result<(Vec<Cluster>, Vec<Cluster>), RecordError> {
        let read = |p: &Path| {
            xyz::read_xyz(p).map_err(|source| RecordError::Io {
                path: p.to_path_buf(),
                source,
            })
        };
        Ok((read(&self.cluster1)?, read(&self.cluster2)?))
    }
}
