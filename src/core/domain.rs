use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

// --- Physics Types ---

/// A single atom instance in a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<f64>, // amu
    pub position: Point3<f64>, // Å
}

impl Atom {
    pub fn new(symbol: &str, position: Point3<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            mass: None,
            position,
        }
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = Some(mass);
        self
    }
}

// --- The Core Entity ---

/// A rigid molecule or molecular fragment.
///
/// **Invariant**: the number and order of atoms is fixed at construction.
/// Geometry operations move atoms in place but never add or remove them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    atoms: Vec<Atom>,
}

impl Cluster {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    /// One-atom cluster, e.g. a noble gas partner.
    pub fn single(symbol: &str, position: Point3<f64>) -> Self {
        Self::new(vec![Atom::new(symbol, position)])
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.atoms.iter().map(|a| a.symbol.as_str()).collect()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Point3<f64>> {
        self.atoms.iter().map(|a| &a.position)
    }

    /// Arithmetic mean of the atom positions.
    pub fn center_coordinates(&self) -> Point3<f64> {
        if self.atoms.is_empty() {
            return Point3::origin();
        }
        let mut sum = Vector3::zeros();
        for a in &self.atoms {
            sum += a.position.coords;
        }
        Point3::from(sum / self.atoms.len() as f64)
    }

    /// Moves the geometric center to the origin.
    pub fn center(&mut self) {
        let c = self.center_coordinates().coords;
        self.translate(&(-c));
    }

    pub fn translate(&mut self, by: &Vector3<f64>) {
        for a in &mut self.atoms {
            a.position += by;
        }
    }

    /// Rotates about the origin of coordinates.
    pub fn rotate(&mut self, rot: &Rotation3<f64>) {
        for a in &mut self.atoms {
            a.position = rot * a.position;
        }
    }

    pub fn rotate_x(&mut self, theta: f64) {
        self.rotate(&Rotation3::from_axis_angle(&Vector3::x_axis(), theta));
    }

    pub fn rotate_y(&mut self, theta: f64) {
        self.rotate(&Rotation3::from_axis_angle(&Vector3::y_axis(), theta));
    }

    pub fn rotate_z(&mut self, theta: f64) {
        self.rotate(&Rotation3::from_axis_angle(&Vector3::z_axis(), theta));
    }

    /// Concatenation of both clusters, `self` first.
    pub fn combined(&self, other: &Cluster) -> Cluster {
        let mut atoms = Vec::with_capacity(self.len() + other.len());
        atoms.extend_from_slice(&self.atoms);
        atoms.extend_from_slice(&other.atoms);
        Cluster { atoms }
    }
}

/// One evaluated geometry: two clusters placed relative to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPair {
    pub first: Cluster,
    pub second: Cluster,
}

impl ClusterPair {
    pub fn new(first: Cluster, second: Cluster) -> Self {
        Self { first, second }
    }

    pub fn combined(&self) -> Cluster {
        self.first.combined(&self.second)
    }

    /// Index of the first atom of `second` in the combined cluster.
    pub fn split_index(&self) -> usize {
        self.first.len()
    }

    /// Distance between the geometric centers of the two clusters.
    pub fn separation(&self) -> f64 {
        nalgebra::distance(
            &self.first.center_coordinates(),
            &self.second.center_coordinates(),
        )
    }

    /// Closest approach between any atom of `first` and any atom of `second`.
    pub fn min_distance(&self) -> f64 {
        let mut best = f64::INFINITY;
        for p in self.first.positions() {
            for q in self.second.positions() {
                best = best.min(nalgebra::distance(p, q));
            }
        }
        best
    }
}
