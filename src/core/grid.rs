use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::domain::ClusterPair;
use crate::error::GridError;

/// Position of a point in the grid: sampled line and slot along the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointId {
    pub line: usize,
    pub slot: usize,
}

impl PointId {
    pub fn new(line: usize, slot: usize) -> Self {
        Self { line, slot }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}p{}", self.line, self.slot)
    }
}

/// Lifecycle of a point: `Pending -> Computed | Failed`. Padding slots
/// beyond the end of a short line are `NotApplicable` forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PointState {
    NotApplicable,
    Pending,
    /// Energy in hartree.
    Computed(f64),
    /// Failure reason reported by the backend.
    Failed(String),
}

impl PointState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PointState::Pending)
    }

    pub fn is_applicable(&self) -> bool {
        !matches!(self, PointState::NotApplicable)
    }

    pub fn energy(&self) -> Option<f64> {
        match self {
            PointState::Computed(e) => Some(*e),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PointState::NotApplicable => "not_applicable",
            PointState::Pending => "pending",
            PointState::Computed(_) => "computed",
            PointState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub id: PointId,
    /// Center-to-center separation of the two clusters (Å), zero for padding.
    pub distance: f64,
    /// `None` only for padding slots.
    pub geometry: Option<ClusterPair>,
    pub state: PointState,
}

/// One sampled line before it is placed into a grid.
#[derive(Debug, Clone, Default)]
pub struct Line {
    pub distances: Vec<f64>,
    pub geometries: Vec<ClusterPair>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCounts {
    /// Applicable points (everything except padding).
    pub total: usize,
    pub pending: usize,
    pub computed: usize,
    pub failed: usize,
    pub not_applicable: usize,
}

/// Fixed-shape `nlines x width` container of sample points, row-major.
/// This is the unit of checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridParts")]
pub struct SamplingGrid {
    nlines: usize,
    width: usize,
    points: Vec<SamplePoint>,
}

/// A grid as read from disk, before its shape is checked.
#[derive(Deserialize)]
struct GridParts {
    nlines: usize,
    width: usize,
    points: Vec<SamplePoint>,
}

impl TryFrom<GridParts> for SamplingGrid {
    type Error = GridError;

    fn try_from(parts: GridParts) -> Result<Self, GridError> {
        let GridParts {
            nlines,
            width,
            points,
        } = parts;
        if nlines.checked_mul(width) != Some(points.len()) {
            return Err(GridError::Malformed(format!(
                "{} points do not fill {} lines of {} slots",
                points.len(),
                nlines,
                width
            )));
        }
        for (i, p) in points.iter().enumerate() {
            let expected = PointId::new(i / width, i % width);
            if p.id != expected {
                return Err(GridError::Malformed(format!(
                    "point {} is stored at position {}",
                    p.id, expected
                )));
            }
            if p.state.is_applicable() != p.geometry.is_some() {
                return Err(GridError::Malformed(format!(
                    "point {} is {} but {} a geometry",
                    p.id,
                    p.state.name(),
                    if p.geometry.is_some() { "has" } else { "lacks" }
                )));
            }
        }
        Ok(Self {
            nlines,
            width,
            points,
        })
    }
}

impl SamplingGrid {
    /// Builds a grid from ragged lines. The width is the longest line; the
    /// tail of every shorter line is padded with `NotApplicable` slots.
    pub fn from_lines(lines: Vec<Line>) -> Self {
        let nlines = lines.len();
        let width = lines.iter().map(|l| l.geometries.len()).max().unwrap_or(0);
        let mut points = Vec::with_capacity(nlines * width);

        for (li, line) in lines.into_iter().enumerate() {
            let n = line.geometries.len();
            for (slot, (d, g)) in line.distances.into_iter().zip(line.geometries).enumerate() {
                points.push(SamplePoint {
                    id: PointId::new(li, slot),
                    distance: d,
                    geometry: Some(g),
                    state: PointState::Pending,
                });
            }
            for slot in n..width {
                points.push(SamplePoint {
                    id: PointId::new(li, slot),
                    distance: 0.0,
                    geometry: None,
                    state: PointState::NotApplicable,
                });
            }
        }

        Self {
            nlines,
            width,
            points,
        }
    }

    pub fn nlines(&self) -> usize {
        self.nlines
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn points(&self) -> &[SamplePoint] {
        &self.points
    }

    fn index(&self, id: PointId) -> Result<usize, GridError> {
        if id.line < self.nlines && id.slot < self.width {
            Ok(id.line * self.width + id.slot)
        } else {
            Err(GridError::OutOfBounds(id))
        }
    }

    pub fn get(&self, id: PointId) -> Option<&SamplePoint> {
        self.index(id).ok().map(|i| &self.points[i])
    }

    pub fn line(&self, line: usize) -> &[SamplePoint] {
        if line >= self.nlines {
            return &[];
        }
        &self.points[line * self.width..(line + 1) * self.width]
    }

    pub fn pending_ids(&self) -> Vec<PointId> {
        self.points
            .iter()
            .filter(|p| p.state.is_pending())
            .map(|p| p.id)
            .collect()
    }

    /// Row-per-line mask, `true` only for points still waiting for an energy.
    pub fn not_calculated(&self) -> Vec<Vec<bool>> {
        (0..self.nlines)
            .map(|l| self.line(l).iter().map(|p| p.state.is_pending()).collect())
            .collect()
    }

    pub fn counts(&self) -> GridCounts {
        let mut c = GridCounts::default();
        for p in &self.points {
            match p.state {
                PointState::NotApplicable => c.not_applicable += 1,
                PointState::Pending => c.pending += 1,
                PointState::Computed(_) => c.computed += 1,
                PointState::Failed(_) => c.failed += 1,
            }
        }
        c.total = c.pending + c.computed + c.failed;
        c
    }

    /// Records the outcome of one evaluation. Only `Pending` points accept a
    /// result, so each point transitions exactly once.
    pub fn record(&mut self, id: PointId, outcome: Result<f64, String>) -> Result<(), GridError> {
        let i = self.index(id)?;
        let point = &mut self.points[i];
        if !point.state.is_pending() {
            return Err(GridError::NotPending {
                id,
                state: point.state.name(),
            });
        }
        point.state = match outcome {
            Ok(e) => PointState::Computed(e),
            Err(reason) => PointState::Failed(reason),
        };
        Ok(())
    }

    /// Marks every applicable point pending again. Used when the stored
    /// geometries are reused with a different calculator, which is a new run
    /// rather than a resume.
    pub fn reset_for_new_calculator(&mut self) {
        for p in &mut self.points {
            if p.state.is_applicable() {
                p.state = PointState::Pending;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Cluster;
    use nalgebra::Point3;

    fn line(n: usize) -> Line {
        let mut l = Line::default();
        for k in 0..n {
            let d = 3.0 + k as f64;
            l.distances.push(d);
            l.geometries.push(ClusterPair::new(
                Cluster::single("Ar", Point3::origin()),
                Cluster::single("Ar", Point3::new(0.0, 0.0, d)),
            ));
        }
        l
    }

    #[test]
    fn ragged_lines_are_padded() {
        let grid = SamplingGrid::from_lines(vec![line(3), line(1), line(0)]);
        assert_eq!(grid.nlines(), 3);
        assert_eq!(grid.width(), 3);
        let c = grid.counts();
        assert_eq!(c.pending, 4);
        assert_eq!(c.not_applicable, 5);
        assert_eq!(c.total, 4);
        assert_eq!(grid.not_calculated()[1], vec![true, false, false]);
    }

    #[test]
    fn record_is_one_way() {
        let mut grid = SamplingGrid::from_lines(vec![line(2)]);
        let id = PointId::new(0, 1);
        grid.record(id, Ok(-1.5)).unwrap();
        assert_eq!(grid.get(id).unwrap().state.energy(), Some(-1.5));
        assert!(matches!(
            grid.record(id, Err("again".into())),
            Err(GridError::NotPending { .. })
        ));
        assert!(matches!(
            grid.record(PointId::new(0, 5), Ok(0.0)),
            Err(GridError::OutOfBounds(_))
        ));
    }

    #[test]
    fn damaged_grids_are_rejected() {
        let grid = SamplingGrid::from_lines(vec![line(2), line(1)]);
        let good = serde_json::to_value(&grid).unwrap();
        assert_eq!(serde_json::from_value::<SamplingGrid>(good.clone()).unwrap(), grid);

        let mut v = good.clone();
        v["nlines"] = serde_json::json!(3);
        assert!(serde_json::from_value::<SamplingGrid>(v).is_err());

        let mut v = good.clone();
        v["points"][1]["id"]["slot"] = serde_json::json!(0);
        let err = serde_json::from_value::<SamplingGrid>(v).unwrap_err();
        assert!(err.to_string().contains("stored at position"));

        let mut v = good;
        v["points"][3]["state"] = serde_json::json!({"state": "pending"});
        assert!(serde_json::from_value::<SamplingGrid>(v).is_err());
    }

    #[test]
    fn padding_never_becomes_pending() {
        let mut grid = SamplingGrid::from_lines(vec![line(2), line(1)]);
        grid.record(PointId::new(0, 0), Ok(1.0)).unwrap();
        grid.record(PointId::new(1, 0), Err("scf".into())).unwrap();
        grid.reset_for_new_calculator();
        let c = grid.counts();
        assert_eq!(c.pending, 3);
        assert_eq!(c.not_applicable, 1);
    }
}
