use std::fs;

use potcalc::core::grid::{PointId, PointState};
use potcalc::engine::calculator::{Calculator, Program};
use potcalc::engine::external::psi4::Psi4Config;
use potcalc::error::RecordError;
use potcalc::io::records::{self, RecordFile, RestartRecord, FORMAT_VERSION};
use potcalc::solvers::plan::PlanConfig;
use tempfile::tempdir;

use crate::common::{argon, argon_grid, calculator};

mod common;

/// Grid holding every point state.
fn mixed_record() -> RestartRecord {
    let mut grid = argon_grid(&[&[3.5, 3.6, 3.7][..], &[4.0][..]]);
    grid.record(PointId::new(0, 0), Ok(0.1 + 0.2)).unwrap();
    grid.record(PointId::new(0, 1), Err("ORCA did not terminate normally".into())).unwrap();
    // (0, 2) stays pending, (1, 1) and (1, 2) are padding.
    grid.record(PointId::new(1, 0), Ok(-1.234_567_890_123_456_7e-5)).unwrap();
    RestartRecord::new(calculator(), argon(), argon(), Some(PlanConfig::default()), grid)
}

#[test]
fn test_restart_round_trip_keeps_every_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.restart.json");
    let record = mixed_record();

    records::write_restart(&path, &record).unwrap();
    let loaded = records::load_restart(&path).unwrap();

    assert_eq!(loaded.grid, record.grid);
    assert_eq!(loaded.calculator, record.calculator);
    assert_eq!(loaded.run_id, record.run_id);
    assert_eq!(loaded.parameters, record.parameters);
    assert!(loaded.written_at.is_some());

    let counts = loaded.grid.counts();
    assert_eq!((counts.computed, counts.failed, counts.pending, counts.not_applicable), (2, 1, 1, 2));
    assert_eq!(
        loaded.grid.not_calculated(),
        vec![vec![false, false, true], vec![false, false, false]]
    );
}

#[test]
fn test_unknown_fields_are_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("future.json");
    let record = mixed_record();

    let mut value = serde_json::to_value(RecordFile::Restart(record.clone())).unwrap();
    value["format_version"] = serde_json::json!(FORMAT_VERSION + 1);
    value["written_by"] = serde_json::json!("a newer release");
    value["grid"]["layout"] = serde_json::json!("row-major");
    fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let loaded = records::load_restart(&path).unwrap();
    assert_eq!(loaded.grid, record.grid);
}

#[test]
fn test_grid_with_wrong_shape_is_a_format_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("edited.json");
    let mut value = serde_json::to_value(RecordFile::Restart(mixed_record())).unwrap();
    value["grid"]["nlines"] = serde_json::json!(3);
    fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    assert!(matches!(records::load_restart(&path), Err(RecordError::Format { .. })));
}

#[test]
fn test_wrong_kind_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.save.json");
    records::write_save(&path, &mixed_record().to_save()).unwrap();

    match records::load_restart(&path) {
        Err(RecordError::WrongKind { expected, found, .. }) => {
            assert_eq!(expected, "restart");
            assert_eq!(found, "save");
        }
        other => panic!("expected WrongKind, got {:?}", other.map(|_| ())),
    }
    assert!(records::load_save(&path).is_ok());
}

#[test]
fn test_malformed_file_is_a_format_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, b"{\"kind\": \"restart\", \"grid\": ").unwrap();

    assert!(matches!(records::load_restart(&path), Err(RecordError::Format { .. })));
    assert!(matches!(
        records::load_restart(&dir.path().join("absent.json")),
        Err(RecordError::Io { .. })
    ));
}

#[test]
fn test_atomic_write_replaces_and_leaves_no_temp_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.restart.json");
    fs::write(&path, b"old checkpoint").unwrap();

    records::write_restart(&path, &mixed_record()).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["run.restart.json".to_string()]);
    assert!(records::load_restart(&path).is_ok());
}

#[test]
fn test_failed_atomic_write_keeps_previous_file() {
    let dir = tempdir().unwrap();
    // A directory in place of the target makes the rename fail.
    let target = dir.path().join("occupied");
    fs::create_dir(&target).unwrap();
    fs::write(target.join("keep"), b"x").unwrap();

    assert!(records::write_atomic(&target, b"new").is_err());
    assert!(target.join("keep").exists());
    assert!(!dir.path().join(".occupied.tmp").exists());
}

#[test]
fn test_save_keeps_only_computed_points() {
    let save = mixed_record().to_save();
    assert_eq!(save.points.len(), 2);
    assert_eq!(save.points[0].id, PointId::new(0, 0));
    assert_eq!(save.points[1].id, PointId::new(1, 0));

    // Reusing the saved geometries: same positions, all pending.
    let grid = save.to_grid();
    assert_eq!(grid.counts().pending, 2);
    assert_eq!(grid.get(PointId::new(1, 0)).unwrap().distance, 4.0);
}

#[test]
fn test_recalculation_resets_states_and_run() {
    let record = mixed_record();
    let old_run = record.run_id;
    let psi4 = Calculator::new("MP2", "aug-cc-pVTZ", Program::Psi4(Psi4Config::default()));

    let again = record.recalculate_with(psi4.clone());

    assert_ne!(again.run_id, old_run);
    assert_eq!(again.calculator, psi4);
    assert_eq!(again.grid.counts().pending, 4);
    assert_eq!(again.grid.get(PointId::new(1, 1)).unwrap().state, PointState::NotApplicable);

    let from_save = RestartRecord::from_save(mixed_record().to_save(), psi4);
    assert_eq!(from_save.grid.counts().pending, 2);
    assert!(from_save.parameters.is_none());
}

#[test]
fn test_csv_export() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("points.csv");
    mixed_record().to_save().write_csv(&path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "line,slot,distance,energy");
    assert_eq!(lines.len(), 3);
    assert!(lines[2].starts_with("1,0,4,"));
}
