use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;

use crate::core::grid::PointId;
use crate::solvers::{ProgressEvent, RunEvent, RunSummary};

const LOG_CAPACITY: usize = 200;
const FAILURE_CAPACITY: usize = 50;
/// Minimum time between two progress lines in the log.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Waiting,
    Running,
    Finished,
    /// The run hung up without a `Finished` event.
    Disconnected,
}

/// What an observer knows about a run at a given moment.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub status: RunStatus,
    pub completed: usize,
    pub total: usize,
    pub steps_per_point: usize,
    pub failed: usize,
    pub recent_failures: VecDeque<(PointId, String)>,
    pub checkpoints: usize,
    pub logs: VecDeque<String>,
    pub summary: Option<RunSummary>,
    pub start_time: Instant,
}

impl MonitorState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Waiting,
            completed: 0,
            total: 0,
            steps_per_point: 1,
            failed: 0,
            recent_failures: VecDeque::with_capacity(FAILURE_CAPACITY),
            checkpoints: 0,
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            summary: None,
            start_time: Instant::now(),
        }
    }

    /// Fraction of this run's points already finished.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }

    /// Backend invocations per second since the monitor started.
    pub fn backend_rate(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.completed * self.steps_per_point) as f64 / secs
    }

    pub fn handle_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Log(msg) => self.log(msg),

            RunEvent::Progress(p) => self.ingest(p),

            RunEvent::CheckpointWritten { completed, path } => {
                self.checkpoints += 1;
                self.log(format!("checkpoint after {} points: {}", completed, path.display()));
            }

            RunEvent::Finished(summary) => {
                self.status = RunStatus::Finished;
                self.log(format!(
                    "finished: {} computed, {} failed",
                    summary.computed, summary.failed
                ));
                self.summary = Some(summary);
            }
        }
    }

    fn ingest(&mut self, p: ProgressEvent) {
        self.status = RunStatus::Running;
        self.completed = p.completed;
        self.total = p.total;
        self.steps_per_point = p.steps_per_point;
        if let Some(failure) = p.last_failure {
            self.failed += 1;
            if self.recent_failures.len() >= FAILURE_CAPACITY {
                self.recent_failures.pop_front();
            }
            self.recent_failures.push_back(failure);
        }
    }

    fn log(&mut self, msg: impl Into<String>) {
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(msg.into());
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains the event queue of a run on its own thread.
pub struct ProgressMonitor {
    state: Arc<Mutex<MonitorState>>,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    pub fn spawn(rx: Receiver<RunEvent>) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(MonitorState::new()));
        let shared = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || {
                let mut last_report = Instant::now();
                for event in rx.iter() {
                    let mut st = shared.lock();
                    st.handle_event(event);
                    if st.status == RunStatus::Running
                        && (last_report.elapsed() >= REPORT_INTERVAL || st.completed == st.total)
                    {
                        info!(
                            "progress: {}/{} points ({:.1}%), {} failed, {:.2} backend calls/s",
                            st.completed,
                            st.total,
                            100.0 * st.fraction(),
                            st.failed,
                            st.backend_rate()
                        );
                        last_report = Instant::now();
                    }
                }
                let mut st = shared.lock();
                if st.status != RunStatus::Finished {
                    warn!("run ended without a summary");
                    st.status = RunStatus::Disconnected;
                }
            })?;

        Ok(Self { state, handle })
    }

    pub fn snapshot(&self) -> MonitorState {
        self.state.lock().clone()
    }

    /// Waits for the sending side to hang up and returns the final state.
    pub fn join(self) -> MonitorState {
        if self.handle.join().is_err() {
            warn!("monitor thread panicked");
        }
        self.state.lock().clone()
    }
}
