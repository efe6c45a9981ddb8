use nalgebra::{Unit, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Cluster, ClusterPair};
use crate::core::spatial;

/// A fixed relative orientation of two clusters. Both are centered at the
/// origin; only the separation along `axis` remains free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub first: Cluster,
    pub second: Cluster,
    pub axis: Unit<Vector3<f64>>,
}

/// Centers both clusters, rotates each independently at random and draws
/// a random translation axis for the second one.
pub fn sample_orientation<R: Rng + ?Sized>(a: &Cluster, b: &Cluster, rng: &mut R) -> Pose {
    let mut first = a.clone();
    let mut second = b.clone();

    first.center();
    second.center();
    first.rotate(&spatial::random_rotation(rng));
    second.rotate(&spatial::random_rotation(rng));

    Pose {
        first,
        second,
        axis: spatial::random_direction(rng),
    }
}

/// Places the second cluster `distance` Å from the first along the pose axis.
pub fn translate_along_axis(pose: &Pose, distance: f64) -> ClusterPair {
    let mut second = pose.second.clone();
    second.translate(&(pose.axis.into_inner() * distance));
    ClusterPair::new(pose.first.clone(), second)
}
