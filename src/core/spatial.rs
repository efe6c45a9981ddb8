use nalgebra::{DMatrix, Point3, Rotation3, Unit, Vector3};
use rand::Rng;
use std::f64::consts::PI;

use crate::core::domain::Cluster;

#[inline]
pub fn distance(p1: &Point3<f64>, p2: &Point3<f64>) -> f64 {
    nalgebra::distance(p1, p2)
}

/// Distance matrix between the atoms of two clusters (`c1` rows, `c2` columns).
pub fn distances(c1: &Cluster, c2: &Cluster) -> DMatrix<f64> {
    DMatrix::from_fn(c1.len(), c2.len(), |i, j| {
        distance(&c1.atoms()[i].position, &c2.atoms()[j].position)
    })
}

/// Distance between atom `i` of `c1` and atom `j` of `c2`.
pub fn distance_between(c1: &Cluster, i: usize, c2: &Cluster, j: usize) -> f64 {
    distance(&c1.atoms()[i].position, &c2.atoms()[j].position)
}

/// Angle (radians) at atom `j` formed by atoms `i`, `j`, `k` of one cluster.
pub fn angle(c: &Cluster, i: usize, j: usize, k: usize) -> f64 {
    let a = c.atoms();
    vertex_angle(&a[i].position, &a[j].position, &a[k].position)
}

/// Angle (radians) at atom `j` of `c1` between atom `i` of `c1` and atom `k` of `c2`.
pub fn cluster_angle(c1: &Cluster, i: usize, j: usize, c2: &Cluster, k: usize) -> f64 {
    let a = c1.atoms();
    vertex_angle(&a[i].position, &a[j].position, &c2.atoms()[k].position)
}

fn vertex_angle(p: &Point3<f64>, vertex: &Point3<f64>, q: &Point3<f64>) -> f64 {
    let u = p - vertex;
    let v = q - vertex;
    u.angle(&v)
}

/// Signed dihedral angle (radians) of atoms `i-j-k-m`.
pub fn dihedral(c: &Cluster, i: usize, j: usize, k: usize, m: usize) -> f64 {
    let a = c.atoms();
    let b1 = a[j].position - a[i].position;
    let b2 = a[k].position - a[j].position;
    let b3 = a[m].position - a[k].position;

    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let m1 = n1.cross(&b2.normalize());
    let x = n1.dot(&n2);
    let y = m1.dot(&n2);
    y.atan2(x)
}

/// Unit vector uniformly distributed on the sphere.
pub fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> Unit<Vector3<f64>> {
    // Archimedes: uniform z and azimuth give a uniform point on the sphere.
    let z: f64 = rng.gen_range(-1.0..=1.0);
    let phi: f64 = rng.gen_range(0.0..2.0 * PI);
    let r = (1.0 - z * z).max(0.0).sqrt();
    Unit::new_normalize(Vector3::new(r * phi.cos(), r * phi.sin(), z))
}

/// Rotation by a random angle about a random axis.
pub fn random_rotation<R: Rng + ?Sized>(rng: &mut R) -> Rotation3<f64> {
    let axis = random_direction(rng);
    let angle = rng.gen_range(0.0..2.0 * PI);
    Rotation3::from_axis_angle(&axis, angle)
}
