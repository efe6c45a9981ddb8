//! On-disk restart and save records.
//!
//! Both are JSON documents wrapped in a tagged envelope
//! (`{"kind": "restart", ...}` / `{"kind": "save", ...}`) carrying a
//! `format_version`. Readers ignore fields they do not know, and fields added
//! later come with defaults, so older readers keep working on newer files.
//!
//! Geometries are stored explicitly. Resuming never re-derives them from a
//! random seed.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::{Cluster, ClusterPair};
use crate::core::grid::{PointId, PointState, SamplingGrid};
use crate::engine::calculator::Calculator;
use crate::error::RecordError;
use crate::solvers::plan::PlanConfig;

pub const FORMAT_VERSION: u32 = 1;

fn current_version() -> u32 {
    FORMAT_VERSION
}

/// Resumable snapshot of a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRecord {
    #[serde(default = "current_version")]
    pub format_version: u32,
    pub run_id: Uuid,
    #[serde(default)]
    pub written_at: Option<DateTime<Utc>>,
    pub calculator: Calculator,
    pub cluster1: Cluster,
    pub cluster2: Cluster,
    #[serde(default)]
    pub parameters: Option<PlanConfig>,
    pub grid: SamplingGrid,
}

impl RestartRecord {
    pub fn new(
        calculator: Calculator,
        cluster1: Cluster,
        cluster2: Cluster,
        parameters: Option<PlanConfig>,
        grid: SamplingGrid,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            run_id: Uuid::new_v4(),
            written_at: None,
            calculator,
            cluster1,
            cluster2,
            parameters,
            grid,
        }
    }

    /// Reuses the geometries of a finished dataset with another calculator.
    /// Every point becomes pending again under a new run id.
    pub fn from_save(save: SaveRecord, calculator: Calculator) -> Self {
        let grid = save.to_grid();
        Self::new(calculator, save.cluster1, save.cluster2, None, grid)
    }

    /// Same geometries, new calculator, every point pending again.
    pub fn recalculate_with(mut self, calculator: Calculator) -> Self {
        self.grid.reset_for_new_calculator();
        self.calculator = calculator;
        self.run_id = Uuid::new_v4();
        self.written_at = None;
        self
    }

    /// The deliverable: computed points only, no mask.
    pub fn to_save(&self) -> SaveRecord {
        let points = self
            .grid
            .points()
            .iter()
            .filter_map(|p| match (&p.state, &p.geometry) {
                (PointState::Computed(e), Some(g)) => Some(ComputedPoint {
                    id: p.id,
                    distance: p.distance,
                    geometry: g.clone(),
                    energy: *e,
                }),
                _ => None,
            })
            .collect();

        SaveRecord {
            format_version: FORMAT_VERSION,
            calculator: self.calculator.clone(),
            cluster1: self.cluster1.clone(),
            cluster2: self.cluster2.clone(),
            points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedPoint {
    pub id: PointId,
    pub distance: f64,
    pub geometry: ClusterPair,
    /// Hartree.
    pub energy: f64,
}

/// Final dataset for potential fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRecord {
    #[serde(default = "current_version")]
    pub format_version: u32,
    pub calculator: Calculator,
    pub cluster1: Cluster,
    pub cluster2: Cluster,
    pub points: Vec<ComputedPoint>,
}

impl SaveRecord {
    /// Grid of the saved geometries, all pending. Points keep their line
    /// and their order along it; dropped slots close up.
    pub fn to_grid(&self) -> SamplingGrid {
        use crate::core::grid::Line;

        let nlines = self.points.iter().map(|p| p.id.line + 1).max().unwrap_or(0);
        let mut slots: Vec<Vec<(usize, f64, ClusterPair)>> = vec![Vec::new(); nlines];
        for p in &self.points {
            slots[p.id.line].push((p.id.slot, p.distance, p.geometry.clone()));
        }
        let lines = slots
            .into_iter()
            .map(|mut s| {
                s.sort_by_key(|(slot, _, _)| *slot);
                let mut line = Line::default();
                for (_, d, g) in s {
                    line.distances.push(d);
                    line.geometries.push(g);
                }
                line
            })
            .collect();
        SamplingGrid::from_lines(lines)
    }

    /// Flat `line,slot,distance,energy` table.
    pub fn write_csv(&self, path: &Path) -> Result<(), RecordError> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(["line", "slot", "distance", "energy"])?;
        for p in &self.points {
            wtr.write_record(&[
                p.id.line.to_string(),
                p.id.slot.to_string(),
                p.distance.to_string(),
                p.energy.to_string(),
            ])?;
        }
        wtr.flush().map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

/// Envelope of every record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordFile {
    Restart(RestartRecord),
    Save(SaveRecord),
}

impl RecordFile {
    fn kind(&self) -> &'static str {
        match self {
            RecordFile::Restart(_) => "restart",
            RecordFile::Save(_) => "save",
        }
    }

    fn version(&self) -> u32 {
        match self {
            RecordFile::Restart(r) => r.format_version,
            RecordFile::Save(s) => s.format_version,
        }
    }
}

/// Writes `bytes` to a temporary file next to `path`, syncs it and renames
/// it over `path`. A crash mid-write leaves the previous file intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = temp_path(path);

    let result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn write_record(path: &Path, record: &RecordFile) -> Result<(), RecordError> {
    let bytes = serde_json::to_vec(record).map_err(|source| RecordError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

pub fn write_restart(path: &Path, record: &RestartRecord) -> Result<(), RecordError> {
    let mut stamped = record.clone();
    stamped.written_at = Some(Utc::now());
    write_record(path, &RecordFile::Restart(stamped))
}

pub fn write_save(path: &Path, record: &SaveRecord) -> Result<(), RecordError> {
    write_record(path, &RecordFile::Save(record.clone()))
}

pub fn load_record(path: &Path) -> Result<RecordFile, RecordError> {
    let text = fs::read_to_string(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: RecordFile = serde_json::from_str(&text).map_err(|source| RecordError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    if record.version() > FORMAT_VERSION {
        warn!(
            "{} was written by a newer format (v{}), unknown fields are ignored",
            path.display(),
            record.version()
        );
    }
    Ok(record)
}

pub fn load_restart(path: &Path) -> Result<RestartRecord, RecordError> {
    match load_record(path)? {
        RecordFile::Restart(r) => Ok(r),
        other => Err(RecordError::WrongKind {
            path: path.to_path_buf(),
            expected: "restart",
            found: other.kind(),
        }),
    }
}

pub fn load_save(path: &Path) -> Result<SaveRecord, RecordError> {
    match load_record(path)? {
        RecordFile::Save(s) => Ok(s),
        other => Err(RecordError::WrongKind {
            path: path.to_path_buf(),
            expected: "save",
            found: other.kind(),
        }),
    }
}
