#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use nalgebra::Point3;
use potcalc::core::domain::{Cluster, ClusterPair};
use potcalc::core::grid::{Line, SamplingGrid};
use potcalc::engine::calculator::{Calculator, Program};
use potcalc::engine::evaluator::{Evaluator, WorkerSession};
use potcalc::engine::external::orca::OrcaConfig;
use potcalc::error::BackendError;

/// Purely repulsive wall: E = sum over real atom pairs of (d0 / r)^12
/// hartree, so a single pair at `d0` sits at exactly 1 Eh.
///
/// Evaluations of geometries whose shortest real pair distance matches an
/// entry of `fail_at` fail. Geometries whose shortest pair, ghosts included,
/// matches an entry of `slow_at` sleep for its delay on every invocation.
pub struct MockEvaluator {
    pub d0: f64,
    pub fail_at: Vec<f64>,
    pub slow_at: Vec<(f64, Duration)>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl MockEvaluator {
    pub fn wall(d0: f64) -> Self {
        Self {
            d0,
            fail_at: Vec::new(),
            slow_at: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(mut self, d: f64) -> Self {
        self.fail_at.push(d);
        self
    }

    pub fn slow_at(mut self, d: f64, delay: Duration) -> Self {
        self.slow_at.push((d, delay));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Counterpoise energy of two single atoms `d` apart.
    pub fn expected(&self, d: f64) -> f64 {
        (self.d0 / d).powi(12)
    }
}

fn matches(list: &[f64], r: f64) -> bool {
    list.iter().any(|d| (d - r).abs() < 1e-6)
}

impl Evaluator for MockEvaluator {
    fn name(&self) -> &str {
        "Mock Evaluator"
    }

    fn energy(
        &self,
        session: &mut WorkerSession,
        geometry: &Cluster,
        ghost: &[usize],
        _tag: &str,
    ) -> Result<f64, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        session.evaluations += 1;
        if let Some(d) = self.delay {
            thread::sleep(d);
        }

        let all: Vec<Point3<f64>> = geometry.atoms().iter().map(|a| a.position).collect();
        if let Some((_, slow)) = self
            .slow_at
            .iter()
            .find(|(d, _)| (d - shortest_pair(&all)).abs() < 1e-6)
        {
            thread::sleep(*slow);
        }

        let real: Vec<Point3<f64>> = geometry
            .atoms()
            .iter()
            .enumerate()
            .filter(|(i, _)| !ghost.contains(i))
            .map(|(_, a)| a.position)
            .collect();

        let mut energy = 0.0;
        for i in 0..real.len() {
            for j in (i + 1)..real.len() {
                energy += (self.d0 / (real[i] - real[j]).norm()).powi(12);
            }
        }

        if matches(&self.fail_at, shortest_pair(&real)) {
            return Err(BackendError::Evaluation("SCF did not converge".into()));
        }
        Ok(energy)
    }
}

fn shortest_pair(points: &[Point3<f64>]) -> f64 {
    let mut shortest = f64::INFINITY;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            shortest = shortest.min((points[i] - points[j]).norm());
        }
    }
    shortest
}

/// Stand-in for the `orca` binary. It requires its input file to exist
/// relative to where it runs, and reports minus the sum of the z
/// coordinates of the real atoms as the energy.
///
/// Written once per test binary: rewriting a script while other threads
/// spawn it can fail with "text file busy".
#[cfg(unix)]
pub fn fake_orca() -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    static SCRIPT: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SCRIPT.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-orca");
        let script = r#"#!/bin/sh
[ -f "$1" ] || { echo "no input $1"; exit 2; }
e=$(awk '/^\*xyz/ { on = 1; next } /^\*/ { on = 0 } on && $1 !~ /:$/ { s += $4 } END { printf "%.10f", -s }' "$1")
echo "FINAL SINGLE POINT ENERGY $e"
echo "                             ****ORCA TERMINATED NORMALLY****"
"#;
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path.clone()
}

#[cfg(unix)]
pub fn fake_calculator() -> Calculator {
    let orca = OrcaConfig {
        executable: fake_orca().to_string_lossy().into_owned(),
        ..OrcaConfig::default()
    };
    Calculator::new("HF", "sto-3g", Program::Orca(orca))
}
