use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::core::grid::PointId;

pub mod coordinator;
pub mod plan;
pub mod sampler;

pub use coordinator::RunSummary;

/// Incremental progress of a calculation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Points finished in this run (computed or failed).
    pub completed: usize,
    /// Points this run set out to evaluate.
    pub total: usize,
    /// Backend invocations behind each point (1 or 3 with counterpoise).
    pub steps_per_point: usize,
    /// The failure that produced this event, if it was one.
    pub last_failure: Option<(PointId, String)>,
}

/// Events emitted by the coordinator to whoever observes the run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Diagnostic log message.
    Log(String),

    Progress(ProgressEvent),

    /// A restart record was written after `completed` points.
    CheckpointWritten { completed: usize, path: PathBuf },

    /// The run has finished.
    Finished(RunSummary),
}

/// Bounded event queue between a run and its observer. The observer must
/// keep draining it, a full queue holds the coordinator back.
pub fn progress_channel(capacity: usize) -> (Sender<RunEvent>, Receiver<RunEvent>) {
    bounded(capacity.max(1))
}
