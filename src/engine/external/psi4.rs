use std::fmt::Write as _;
use std::fs;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Atom, Cluster, ClusterPair};
use crate::engine::calculator::resolve_executable;
use crate::engine::evaluator::WorkerSession;
use crate::engine::external::process;
use crate::error::BackendError;

const ENERGY_TAG: &str = "POTCALC_ENERGY";

/// How to drive Psi4 (through its `psi4` driver executable).
///
/// `charge` and `multiplicity` describe the whole system and, in
/// counterpoise inputs, the first fragment. The second fragment has its own
/// pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Psi4Config {
    pub executable: String,
    pub memory: String,
    pub nthreads: u32,
    pub charge: i32,
    pub multiplicity: u32,
    pub second_charge: i32,
    pub second_multiplicity: u32,
}

impl Default for Psi4Config {
    fn default() -> Self {
        Self {
            executable: "psi4".to_string(),
            memory: "500 MiB".to_string(),
            nthreads: 1,
            charge: 0,
            multiplicity: 1,
            second_charge: 0,
            second_multiplicity: 1,
        }
    }
}

fn write_atom(s: &mut String, atom: &Atom, ghost: bool) {
    let p = atom.position;
    if ghost {
        let _ = writeln!(s, "Gh({}) {:.12} {:.12} {:.12}", atom.symbol, p.x, p.y, p.z);
    } else {
        let _ = writeln!(s, "{} {:.12} {:.12} {:.12}", atom.symbol, p.x, p.y, p.z);
    }
}

fn header(cfg: &Psi4Config, basis: &str) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "memory {}", cfg.memory);
    let _ = writeln!(s, "set_num_threads({})", cfg.nthreads);
    let _ = writeln!(s, "set basis {}", basis);
    s
}

fn footer(s: &mut String, call: &str) {
    let _ = writeln!(s, "e = {}", call);
    let _ = writeln!(s, "print_out(\"\\n{} %.15f\\n\" % e)", ENERGY_TAG);
}

fn molecule_options(s: &mut String) {
    s.push_str("units angstrom\nno_com\nno_reorient\nsymmetry c1\n}\n");
}

/// Single-fragment input; atoms in `ghost` are `Gh(...)` atoms.
pub fn generate_input(
    cfg: &Psi4Config,
    method: &str,
    basis: &str,
    cluster: &Cluster,
    ghost: &[usize],
) -> String {
    let mut s = header(cfg, basis);
    s.push_str("molecule {\n");
    let _ = writeln!(s, "{} {}", cfg.charge, cfg.multiplicity);
    for (i, atom) in cluster.atoms().iter().enumerate() {
        write_atom(&mut s, atom, ghost.contains(&i));
    }
    molecule_options(&mut s);
    footer(&mut s, &format!("energy('{}')", method));
    s
}

/// Two-fragment input; Psi4 performs the counterpoise correction itself.
pub fn generate_counterpoise_input(
    cfg: &Psi4Config,
    method: &str,
    basis: &str,
    pair: &ClusterPair,
) -> String {
    let mut s = header(cfg, basis);
    s.push_str("molecule {\n");
    let _ = writeln!(s, "{} {}", cfg.charge, cfg.multiplicity);
    for atom in pair.first.atoms() {
        write_atom(&mut s, atom, false);
    }
    let _ = writeln!(s, "--\n{} {}", cfg.second_charge, cfg.second_multiplicity);
    for atom in pair.second.atoms() {
        write_atom(&mut s, atom, false);
    }
    molecule_options(&mut s);
    footer(&mut s, &format!("energy('{}', bsse_type='cp')", method));
    s
}

fn energy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"{}\s+(-?\d+\.\d+(?:[eE][-+]?\d+)?)", ENERGY_TAG)).expect("static regex")
    })
}

pub fn read_energy(output: &str) -> Result<f64, BackendError> {
    let caps = energy_regex().captures_iter(output).last().ok_or_else(|| {
        let reason = output
            .lines()
            .find(|l| l.contains("Error") || l.contains("ConvergenceError"))
            .unwrap_or("no energy line in output");
        BackendError::Evaluation(reason.trim().to_string())
    })?;
    caps[1]
        .parse::<f64>()
        .map_err(|e| BackendError::Evaluation(format!("unparsable energy `{}`: {}", &caps[1], e)))
}

fn execute(
    cfg: &Psi4Config,
    session: &mut WorkerSession,
    input: String,
    tag: &str,
) -> Result<f64, BackendError> {
    let stem = session.file_stem(tag);
    let inp = session.path_for(&stem, "dat");
    let out = session.path_for(&stem, "out");
    let log = session.path_for(&stem, "log");

    fs::write(&inp, input)?;

    // Paths relative to the work directory the engine runs in.
    let mut cmd = Command::new(resolve_executable(&cfg.executable));
    cmd.arg("-n")
        .arg(cfg.nthreads.to_string())
        .arg(format!("{stem}.dat"))
        .arg(format!("{stem}.out"))
        .current_dir(&session.work_dir);
    session.evaluations += 1;
    let result = session.invocation_timeout().and_then(|limit| {
        process::run(cmd, &log, limit)?;
        let text = fs::read_to_string(&out)?;
        read_energy(&text)
    });

    session.clean(&stem);
    result
}

pub fn energy(
    cfg: &Psi4Config,
    method: &str,
    basis: &str,
    session: &mut WorkerSession,
    cluster: &Cluster,
    ghost: &[usize],
    tag: &str,
) -> Result<f64, BackendError> {
    let input = generate_input(cfg, method, basis, cluster, ghost);
    execute(cfg, session, input, tag)
}

pub fn counterpoise_energy(
    cfg: &Psi4Config,
    method: &str,
    basis: &str,
    session: &mut WorkerSession,
    pair: &ClusterPair,
    tag: &str,
) -> Result<f64, BackendError> {
    let input = generate_counterpoise_input(cfg, method, basis, pair);
    execute(cfg, session, input, tag)
}
