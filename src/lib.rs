//! Potential-energy surface sampling between two molecular clusters.
//!
//! Lines of geometries are sampled along a random separation axis, handed to
//! an external quantum-chemistry engine by a pool of workers, and collected
//! into restartable records ready for potential fitting.

pub mod error;

pub mod core {
    pub mod domain;
    pub mod grid;
    pub mod spatial;
    pub mod units;
}

pub mod engine {
    pub mod calculator;
    pub mod evaluator;
    pub mod operators;

    pub mod external {
        pub mod orca;
        pub mod process;
        pub mod psi4;
    }
}

pub mod io {
    pub mod records;
    pub mod xyz;
}

pub mod solvers;

pub mod interface {
    pub mod monitor;
}

pub mod config;

pub use crate::error::{Error, Result};
