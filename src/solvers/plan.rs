use log::info;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::domain::Cluster;
use crate::core::grid::SamplingGrid;
use crate::engine::evaluator::{Evaluator, SessionSettings};
use crate::error::ConfigError;
use crate::solvers::sampler::{LineSample, LineSampler, SamplerConfig};

/// Parameters of a whole sampling plan. Persisted with restart records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Number of (first, second) structure pairs drawn from the inputs.
    pub nsamples: usize,
    /// Lines sampled for each drawn pair.
    pub nlines: usize,
    pub seed: Option<u64>,
    pub sampler: SamplerConfig,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            nsamples: 2,
            nlines: 1,
            seed: None,
            sampler: SamplerConfig::default(),
        }
    }
}

impl PlanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nsamples == 0 {
            return Err(ConfigError::invalid("nsamples", "must be positive"));
        }
        if self.nlines == 0 {
            return Err(ConfigError::invalid("nlines", "must be positive"));
        }
        self.sampler.validate()
    }

    pub fn total_lines(&self) -> usize {
        self.nsamples * self.nlines
    }
}

/// Samples `nsamples * nlines` lines and packs them into a grid.
///
/// `first` and `second` are either single structures or trajectories; each
/// sample draws one frame from each side. Lines run in parallel on the rayon
/// pool. Every line owns an RNG stream derived from the seed, so the result
/// does not depend on thread scheduling.
pub fn build_grid(
    evaluator: &dyn Evaluator,
    first: &[Cluster],
    second: &[Cluster],
    config: &PlanConfig,
    sessions: &SessionSettings,
) -> Result<SamplingGrid, ConfigError> {
    config.validate()?;
    if first.is_empty() || second.is_empty() {
        return Err(ConfigError::Other("both sides need at least one structure".into()));
    }
    if let Some(bad) = first.iter().chain(second).position(|c| c.is_empty()) {
        return Err(ConfigError::Other(format!("input structure {bad} has no atoms")));
    }

    let sampler = LineSampler::new(config.sampler.clone())?;
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());

    // Stream 0 picks the frames, stream `line + 1` drives each line.
    let mut picker = ChaCha8Rng::seed_from_u64(seed);
    let picks: Vec<(usize, usize)> = (0..config.nsamples)
        .map(|_| (picker.gen_range(0..first.len()), picker.gen_range(0..second.len())))
        .collect();

    info!(
        "Sampling {} lines ({} pairs x {}) with {} (seed {})",
        config.total_lines(),
        config.nsamples,
        config.nlines,
        evaluator.name(),
        seed
    );

    let samples: Vec<LineSample> = (0..config.total_lines())
        .into_par_iter()
        .map_init(
            || sessions.open(rayon::current_thread_index().unwrap_or(0)),
            |session, line| {
                let (i, j) = picks[line / config.nlines];
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(line as u64 + 1);
                sampler.sample_line(evaluator, session, &first[i], &second[j], &mut rng, line)
            },
        )
        .collect();

    let scheduled: usize = samples.iter().map(LineSample::len).sum();
    let empty = samples.iter().filter(|s| s.is_empty()).count();
    let probes: usize = samples.iter().map(|s| s.probes.len()).sum();
    info!(
        "Sampling done: {} points scheduled, {} empty lines, {} probe evaluations",
        scheduled, empty, probes
    );

    Ok(SamplingGrid::from_lines(
        samples.into_iter().map(LineSample::into_line).collect(),
    ))
}
