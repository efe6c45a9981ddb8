use std::fmt::Write as _;
use std::fs;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::domain::Cluster;
use crate::engine::calculator::resolve_executable;
use crate::engine::evaluator::WorkerSession;
use crate::engine::external::process;
use crate::error::BackendError;

/// How to drive ORCA.
///
/// More than one core requires `executable` to be an absolute path, ORCA's
/// parallel runtime re-launches itself through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    pub executable: String,
    pub ncore: u32,
    /// Memory per core (MB).
    pub maxmem: u32,
    pub charge: i32,
    pub multiplicity: u32,
}

impl Default for OrcaConfig {
    fn default() -> Self {
        Self {
            executable: "orca".to_string(),
            ncore: 1,
            maxmem: 1000,
            charge: 0,
            multiplicity: 1,
        }
    }
}

/// Constructs the ORCA input. Ghost atoms carry a `:` after the symbol.
pub fn generate_input(
    cfg: &OrcaConfig,
    method: &str,
    basis: &str,
    cluster: &Cluster,
    ghost: &[usize],
) -> String {
    let mut s = String::with_capacity(256 + 64 * cluster.len());

    let _ = writeln!(s, "! {} {}", method, basis);
    let _ = writeln!(s, "%maxcore {}", cfg.maxmem);
    if cfg.ncore > 1 {
        let _ = writeln!(s, "%pal nprocs {} end", cfg.ncore);
    }
    let _ = writeln!(s, "*xyz {} {}", cfg.charge, cfg.multiplicity);
    for (i, atom) in cluster.atoms().iter().enumerate() {
        let marker = if ghost.contains(&i) { ":" } else { "" };
        let p = atom.position;
        let _ = writeln!(
            s,
            "{}{} {:.12} {:.12} {:.12}",
            atom.symbol, marker, p.x, p.y, p.z
        );
    }
    s.push_str("*\n");
    s
}

fn energy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"FINAL SINGLE POINT ENERGY\s+(-?\d+\.\d+(?:[eE][-+]?\d+)?)")
            .expect("static regex")
    })
}

/// Final energy (hartree) from ORCA output. Fails unless ORCA terminated
/// normally.
pub fn read_energy(output: &str) -> Result<f64, BackendError> {
    if !output.contains("ORCA TERMINATED NORMALLY") {
        let reason = if output.contains("SCF NOT CONVERGED") {
            "SCF not converged"
        } else {
            "ORCA did not terminate normally"
        };
        return Err(BackendError::Evaluation(reason.to_string()));
    }
    let last = energy_regex()
        .captures_iter(output)
        .last()
        .ok_or_else(|| BackendError::Evaluation("no FINAL SINGLE POINT ENERGY in output".into()))?;
    last[1]
        .parse::<f64>()
        .map_err(|e| BackendError::Evaluation(format!("unparsable energy `{}`: {}", &last[1], e)))
}

pub fn energy(
    cfg: &OrcaConfig,
    method: &str,
    basis: &str,
    session: &mut WorkerSession,
    cluster: &Cluster,
    ghost: &[usize],
    tag: &str,
) -> Result<f64, BackendError> {
    let stem = session.file_stem(tag);
    let inp = session.path_for(&stem, "inp");
    let out = session.path_for(&stem, "out");

    fs::write(&inp, generate_input(cfg, method, basis, cluster, ghost))?;

    // ORCA runs inside the work directory, so it gets the bare file name.
    let mut cmd = Command::new(resolve_executable(&cfg.executable));
    cmd.arg(format!("{stem}.inp")).current_dir(&session.work_dir);
    session.evaluations += 1;
    let result = session.invocation_timeout().and_then(|limit| {
        let status = process::run(cmd, &out, limit)?;
        let text = fs::read_to_string(&out)?;
        match read_energy(&text) {
            Err(e) if !status.success() => Err(BackendError::Evaluation(format!(
                "ORCA exited with {status}: {e}"
            ))),
            other => other,
        }
    });

    session.clean(&stem);
    result
}
