use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::domain::{Cluster, ClusterPair};
use crate::engine::evaluator::{ghost_counterpoise, Evaluator, WorkerSession};
use crate::engine::external::orca::{self, OrcaConfig};
use crate::engine::external::psi4::{self, Psi4Config};
use crate::error::{BackendError, ConfigError};

/// The supported engines. Closed set: adding one means adding a variant
/// and its match arms below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "program", rename_all = "lowercase")]
pub enum Program {
    Orca(OrcaConfig),
    Psi4(Psi4Config),
}

impl Program {
    pub fn executable(&self) -> &str {
        match self {
            Program::Orca(c) => &c.executable,
            Program::Psi4(c) => &c.executable,
        }
    }
}

/// Method, basis and engine of a run. Shared read-only by every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculator {
    pub method: String,
    pub basis: String,
    pub program: Program,
}

impl Calculator {
    pub fn new(method: &str, basis: &str, program: Program) -> Self {
        Self {
            method: method.to_string(),
            basis: basis.to_string(),
            program,
        }
    }

    /// Fails fast on settings that could never produce an energy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.method.trim().is_empty() {
            return Err(ConfigError::invalid("method", "must not be empty"));
        }
        match &self.program {
            Program::Orca(c) => {
                if c.ncore == 0 {
                    return Err(ConfigError::invalid("ncore", "must be at least 1"));
                }
                if c.ncore > 1 && !Path::new(&c.executable).is_absolute() {
                    return Err(ConfigError::invalid(
                        "executable",
                        "parallel ORCA needs the absolute path of the orca binary",
                    ));
                }
            }
            Program::Psi4(c) => {
                if c.nthreads == 0 {
                    return Err(ConfigError::invalid("nthreads", "must be at least 1"));
                }
            }
        }
        find_executable(self.program.executable())
            .map(|_| ())
            .ok_or_else(|| ConfigError::ExecutableNotFound(self.program.executable().to_string()))
    }
}

/// Locates `name` either as a path or on `PATH`. Paths come back absolute.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 || direct.is_absolute() {
        return direct.canonicalize().ok().filter(|p| p.is_file());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// What to spawn for `name`. Engines run inside their work directory, so a
/// relative path must not be resolved against it.
pub fn resolve_executable(name: &str) -> PathBuf {
    find_executable(name).unwrap_or_else(|| PathBuf::from(name))
}

impl Evaluator for Calculator {
    fn name(&self) -> &str {
        match self.program {
            Program::Orca(_) => "ORCA",
            Program::Psi4(_) => "Psi4",
        }
    }

    fn correction_steps(&self) -> usize {
        match self.program {
            Program::Orca(_) => 3,
            Program::Psi4(_) => 1,
        }
    }

    fn energy(
        &self,
        session: &mut WorkerSession,
        geometry: &Cluster,
        ghost: &[usize],
        tag: &str,
    ) -> Result<f64, BackendError> {
        match &self.program {
            Program::Orca(c) => {
                orca::energy(c, &self.method, &self.basis, session, geometry, ghost, tag)
            }
            Program::Psi4(c) => {
                psi4::energy(c, &self.method, &self.basis, session, geometry, ghost, tag)
            }
        }
    }

    fn counterpoise_energy(
        &self,
        session: &mut WorkerSession,
        pair: &ClusterPair,
        tag: &str,
    ) -> Result<f64, BackendError> {
        match &self.program {
            Program::Psi4(c) => {
                psi4::counterpoise_energy(c, &self.method, &self.basis, session, pair, tag)
            }
            Program::Orca(_) => ghost_counterpoise(self, session, pair, tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tags_the_program() {
        let cal = Calculator::new("mp2", "aug-cc-pvdz", Program::Psi4(Psi4Config::default()));
        let json = serde_json::to_string(&cal).unwrap();
        assert!(json.contains("\"program\":\"psi4\""));
        let back: Calculator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cal);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{"method":"RI-MP2","basis":"def2-TZVP","program":{"program":"orca","maxmem":4000}}"#;
        let cal: Calculator = serde_json::from_str(json).unwrap();
        match cal.program {
            Program::Orca(c) => {
                assert_eq!(c.maxmem, 4000);
                assert_eq!(c.executable, "orca");
                assert_eq!(c.ncore, 1);
            }
            _ => panic!("expected ORCA"),
        }
    }

    #[test]
    fn validation_rejects_bad_setups() {
        let cal = Calculator::new(
            "mp2",
            "sto-3g",
            Program::Orca(OrcaConfig {
                ncore: 4,
                ..Default::default()
            }),
        );
        assert!(matches!(cal.validate(), Err(ConfigError::InvalidParameter { name: "executable", .. })));

        let cal = Calculator::new(
            "mp2",
            "sto-3g",
            Program::Orca(OrcaConfig {
                executable: "/nonexistent/bin/orca".into(),
                ..Default::default()
            }),
        );
        assert!(matches!(cal.validate(), Err(ConfigError::ExecutableNotFound(_))));

        let cal = Calculator::new(" ", "sto-3g", Program::Psi4(Psi4Config::default()));
        assert!(matches!(cal.validate(), Err(ConfigError::InvalidParameter { name: "method", .. })));
    }

    #[test]
    fn correction_steps_follow_engine() {
        let orca = Calculator::new("mp2", "b", Program::Orca(OrcaConfig::default()));
        let psi = Calculator::new("mp2", "b", Program::Psi4(Psi4Config::default()));
        assert_eq!(orca.correction_steps(), 3);
        assert_eq!(psi.correction_steps(), 1);
    }
}
