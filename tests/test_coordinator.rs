use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use potcalc::core::grid::{PointId, PointState, SamplingGrid};
use potcalc::engine::evaluator::{EnergyMode, Evaluator, SessionSettings};
use potcalc::io::records::{self, RestartRecord};
use potcalc::solvers::coordinator::{Coordinator, CoordinatorConfig};
use potcalc::solvers::RunEvent;
use potcalc::Error;
use tempfile::tempdir;

use crate::common::{argon, argon_grid, calculator, MockEvaluator};

mod common;

fn settings(dir: &Path, workers: usize, save_after: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        workers,
        save_after: Some(save_after),
        restart_path: Some(dir.join("run.restart.json")),
        save_path: Some(dir.join("run.save.json")),
        sessions: SessionSettings {
            work_dir: dir.to_path_buf(),
            basename: "test".into(),
            ..SessionSettings::default()
        },
        mode: EnergyMode::Counterpoise,
    }
}

fn record(grid: SamplingGrid) -> RestartRecord {
    RestartRecord::new(calculator(), argon(), argon(), None, grid)
}

fn distances(n: usize) -> Vec<f64> {
    (0..n).map(|k| 3.5 + 0.25 * k as f64).collect()
}

#[test]
fn test_every_point_recorded_exactly_once() {
    let dir = tempdir().unwrap();
    let eval = Arc::new(MockEvaluator::wall(3.0).with_delay(Duration::from_millis(1)));
    let l0 = distances(9);
    let l1 = distances(6);
    let l2 = distances(8);
    let grid = argon_grid(&[&l0[..], &l1[..], &l2[..]]);

    let coord = Coordinator::new(eval.clone(), settings(dir.path(), 4, 5)).unwrap();
    let out = coord.run(record(grid), None).unwrap();

    assert_eq!(out.summary.attempted, 23);
    assert_eq!(out.summary.computed, 23);
    assert_eq!(out.summary.failed, 0);
    assert_eq!(eval.calls(), 23 * 3);
    assert_eq!(out.record.grid.counts().pending, 0);
    assert_eq!(out.record.grid.counts().not_applicable, 4);
    for p in out.record.grid.points() {
        if let PointState::Computed(e) = p.state {
            assert!((e - eval.expected(p.distance)).abs() < 1e-12, "{}", p.id);
        }
    }
    assert_eq!(out.save.points.len(), 23);
}

#[test]
fn test_checkpoint_cadence() {
    let dir = tempdir().unwrap();
    let eval = Arc::new(MockEvaluator::wall(3.0));
    let cfg = settings(dir.path(), 3, 4);
    let restart = cfg.restart_path.clone().unwrap();
    let save = cfg.save_path.clone().unwrap();
    // m = 3 full batches of k = 4, r = 2.
    let l0 = distances(7);
    let l1 = distances(7);
    let grid = argon_grid(&[&l0[..], &l1[..]]);

    let (tx, rx) = unbounded();
    let out = Coordinator::new(eval, cfg).unwrap().run(record(grid), Some(tx)).unwrap();

    let checkpoints: Vec<usize> = rx
        .try_iter()
        .filter_map(|e| match e {
            RunEvent::CheckpointWritten { completed, .. } => Some(completed),
            _ => None,
        })
        .collect();
    assert_eq!(checkpoints, vec![4, 8, 12]);
    assert_eq!(out.summary.checkpoints_written, 3);

    // The last checkpoint reflects exactly the first 12 completions.
    let last = records::load_restart(&restart).unwrap();
    let counts = last.grid.counts();
    assert_eq!(counts.computed, 12);
    assert_eq!(counts.pending, 2);

    let saved = records::load_save(&save).unwrap();
    assert_eq!(saved, out.save);
    assert_eq!(saved.points.len(), 14);
}

#[test]
fn test_resume_of_finished_run_does_nothing() {
    let dir = tempdir().unwrap();
    let mut cfg = settings(dir.path(), 2, 3);
    cfg.save_path = None;
    let restart = cfg.restart_path.clone().unwrap();
    let l0 = distances(5);
    let grid = argon_grid(&[&l0[..], &[4.0, 4.5][..]]);

    let first = Coordinator::new(Arc::new(MockEvaluator::wall(3.0)), cfg.clone())
        .unwrap()
        .run(record(grid), None)
        .unwrap();

    let eval = Arc::new(MockEvaluator::wall(3.0));
    let again = Coordinator::new(eval.clone(), cfg).unwrap().resume(&restart, None).unwrap();

    assert_eq!(eval.calls(), 0);
    assert_eq!(again.summary.attempted, 0);
    assert_eq!(again.summary.previously_computed, 7);
    assert_eq!(again.save, first.save);
    assert_eq!(again.record.grid, first.record.grid);
}

#[test]
fn test_resume_computes_only_pending_points() {
    let dir = tempdir().unwrap();
    let cfg = settings(dir.path(), 2, 2);
    let l0 = distances(6);
    let mut grid = argon_grid(&[&l0[..]]);
    grid.record(PointId::new(0, 0), Ok(-1.0)).unwrap();
    grid.record(PointId::new(0, 3), Err("lost".into())).unwrap();

    let eval = Arc::new(MockEvaluator::wall(3.0));
    let out = Coordinator::new(eval.clone(), cfg).unwrap().run(record(grid), None).unwrap();

    assert_eq!(eval.calls(), 4 * 3);
    assert_eq!(out.summary.previously_computed, 1);
    assert_eq!(out.summary.previously_failed, 1);
    assert_eq!(out.summary.attempted, 4);
    // Earlier results are returned verbatim.
    assert_eq!(
        out.record.grid.get(PointId::new(0, 0)).unwrap().state,
        PointState::Computed(-1.0)
    );
    assert!(matches!(
        out.record.grid.get(PointId::new(0, 3)).unwrap().state,
        PointState::Failed(_)
    ));
}

#[test]
fn test_failures_are_recorded_and_not_retried() {
    let dir = tempdir().unwrap();
    let mut cfg = settings(dir.path(), 3, 10);
    cfg.save_path = None;
    let restart = cfg.restart_path.clone().unwrap();
    let l0 = distances(6);
    let grid = argon_grid(&[&l0[..]]);

    let eval = Arc::new(MockEvaluator::wall(3.0).failing_at(4.0));
    let out = Coordinator::new(eval, cfg.clone()).unwrap().run(record(grid), None).unwrap();

    assert_eq!(out.summary.computed, 5);
    assert_eq!(out.summary.failed, 1);
    let (id, reason) = &out.summary.failures[0];
    assert_eq!(*id, PointId::new(0, 2));
    assert!(reason.contains("SCF did not converge"));
    assert_eq!(out.save.points.len(), 5);

    let eval = Arc::new(MockEvaluator::wall(3.0));
    let again = Coordinator::new(eval.clone(), cfg).unwrap().resume(&restart, None).unwrap();
    assert_eq!(eval.calls(), 0);
    assert_eq!(again.summary.previously_failed, 1);
}

#[test]
fn test_timeout_bounds_each_point() {
    let dir = tempdir().unwrap();
    let mut cfg = settings(dir.path(), 2, 10);
    cfg.sessions.timeout = Some(Duration::from_millis(300));
    let l0 = distances(4);
    let grid = argon_grid(&[&l0[..]]);

    // Every invocation at 3.75 takes 200 ms: each fits the bound, the
    // three of a counterpoise point do not.
    let eval = Arc::new(MockEvaluator::wall(3.0).slow_at(3.75, Duration::from_millis(200)));
    let out = Coordinator::new(eval.clone(), cfg).unwrap().run(record(grid), None).unwrap();

    assert_eq!(out.summary.failed, 1);
    let (id, reason) = &out.summary.failures[0];
    assert_eq!(*id, PointId::new(0, 1));
    assert!(reason.contains("timed out"), "{reason}");
    assert_eq!(out.summary.computed, 3);
    // The last invocation of the slow point is never started.
    assert_eq!(eval.calls(), 3 * 3 + 2);
}

#[test]
fn test_progress_events_are_typed_and_complete() {
    let dir = tempdir().unwrap();
    let cfg = settings(dir.path(), 3, 100);
    let l0 = distances(5);
    let grid = argon_grid(&[&l0[..], &l0[..]]);

    let (tx, rx) = unbounded();
    let eval = Arc::new(MockEvaluator::wall(3.0).failing_at(3.5));
    Coordinator::new(eval, cfg).unwrap().run(record(grid), Some(tx)).unwrap();

    let events: Vec<RunEvent> = rx.try_iter().collect();
    assert!(matches!(events.first(), Some(RunEvent::Log(_))));
    assert!(matches!(events.last(), Some(RunEvent::Finished(_))));

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 10);
    assert!(progress.iter().all(|p| p.total == 10 && p.steps_per_point == 3));
    let completed: Vec<usize> = progress.iter().map(|p| p.completed).collect();
    assert_eq!(completed, (1..=10).collect::<Vec<_>>());
    assert_eq!(progress.iter().filter(|p| p.last_failure.is_some()).count(), 2);
}

#[test]
fn test_checkpoint_failure_returns_grid() {
    let dir = tempdir().unwrap();
    let sub = dir.path().join("gone");
    fs::create_dir(&sub).unwrap();
    let mut cfg = settings(dir.path(), 2, 2);
    cfg.restart_path = Some(sub.join("run.restart.json"));
    let l0 = distances(8);
    let grid = argon_grid(&[&l0[..]]);

    let coord = Coordinator::new(Arc::new(MockEvaluator::wall(3.0)), cfg).unwrap();
    fs::remove_dir(&sub).unwrap();

    match coord.run(record(grid), None) {
        Err(Error::Checkpoint { record, .. }) => {
            assert!(record.grid.counts().computed >= 2);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("checkpoint should have failed"),
    }
    assert!(!dir.path().join("run.save.json").exists());
}

#[test]
fn test_failed_final_save_returns_grid() {
    let dir = tempdir().unwrap();
    let mut cfg = settings(dir.path(), 2, 100);
    let occupied = dir.path().join("occupied");
    fs::create_dir(&occupied).unwrap();
    cfg.save_path = Some(occupied.clone());
    let grid = argon_grid(&[&[3.5, 4.0, 4.5][..]]);

    match Coordinator::new(Arc::new(MockEvaluator::wall(3.0)), cfg).unwrap().run(record(grid), None) {
        Err(Error::Checkpoint { path, record, .. }) => {
            assert_eq!(path, occupied);
            assert_eq!(record.grid.counts().computed, 3);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("the save should have failed"),
    }
}

#[test]
fn test_cancel_mid_run_keeps_restart_current() {
    let dir = tempdir().unwrap();
    let cfg = settings(dir.path(), 1, 100);
    let restart = cfg.restart_path.clone().unwrap();
    let save = cfg.save_path.clone().unwrap();
    let l0 = distances(12);
    let grid = argon_grid(&[&l0[..]]);

    let eval = Arc::new(MockEvaluator::wall(3.0).with_delay(Duration::from_millis(10)));
    let coord = Coordinator::new(eval, cfg.clone()).unwrap();
    let token = coord.cancel_token();
    let (tx, rx) = unbounded();
    let listener = std::thread::spawn(move || {
        for event in rx.iter() {
            if let RunEvent::Progress(p) = event {
                if p.completed == 3 {
                    token.cancel();
                }
            }
        }
    });
    let out = coord.run(record(grid), Some(tx)).unwrap();
    listener.join().unwrap();

    assert!(out.summary.skipped > 0);
    assert_eq!(out.summary.computed + out.summary.skipped, 12);
    assert!(!save.exists());
    let on_disk = records::load_restart(&restart).unwrap();
    assert_eq!(on_disk.grid, out.record.grid);

    // Resuming computes exactly the points the cancelled run left.
    let eval = Arc::new(MockEvaluator::wall(3.0));
    let again = Coordinator::new(eval.clone(), cfg).unwrap().resume(&restart, None).unwrap();
    assert_eq!(again.summary.attempted, out.summary.skipped);
    assert_eq!(eval.calls(), out.summary.skipped * 3);
    assert_eq!(again.save.points.len(), 12);
}

#[test]
fn test_cancelled_run_leaves_points_pending() {
    let dir = tempdir().unwrap();
    let cfg = settings(dir.path(), 2, 10);
    let l0 = distances(6);
    let grid = argon_grid(&[&l0[..]]);

    let eval = Arc::new(MockEvaluator::wall(3.0));
    let coord = Coordinator::new(eval.clone(), cfg).unwrap();
    coord.cancel_token().cancel();
    let out = coord.run(record(grid), None).unwrap();

    assert_eq!(eval.calls(), 0);
    assert_eq!(out.summary.skipped, 6);
    assert_eq!(out.record.grid.counts().pending, 6);
}

#[test]
fn test_plain_energies_use_one_call_per_point() {
    let dir = tempdir().unwrap();
    let mut cfg = settings(dir.path(), 2, 10);
    cfg.mode = EnergyMode::Total { ghost: vec![] };
    let grid = argon_grid(&[&[3.0, 6.0][..]]);

    let eval = Arc::new(MockEvaluator::wall(3.0));
    let out = Coordinator::new(eval.clone(), cfg).unwrap().run(record(grid), None).unwrap();

    assert_eq!(eval.calls(), 2);
    assert_eq!(out.save.points[0].energy, 1.0);
    assert_eq!(eval.name(), "Mock Evaluator");
}

#[test]
fn test_invalid_coordinator_config() {
    let dir = tempdir().unwrap();
    let eval = Arc::new(MockEvaluator::wall(3.0));

    let mut cfg = settings(dir.path(), 0, 1);
    assert!(Coordinator::new(eval.clone(), cfg.clone()).is_err());

    cfg.workers = 2;
    cfg.save_after = Some(0);
    assert!(Coordinator::new(eval.clone(), cfg.clone()).is_err());

    cfg.save_after = None;
    cfg.restart_path = Some(dir.path().join("missing").join("r.json"));
    assert!(Coordinator::new(eval, cfg).is_err());
}
