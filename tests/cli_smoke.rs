mod common;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use linkage_harness::{LinkType, ParameterHistory, Settings};
use tempfile::tempdir;

use common::value_counts;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    settings: PathBuf,
    people: PathBuf,
    records: Vec<linkage_harness::Record>,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let settings = root.join("settings.json");
    let raw = serde_json::to_string_pretty(&common::settings(LinkType::DedupeOnly)).unwrap();
    std::fs::write(&settings, raw).unwrap();

    let records = common::people(150, 11);
    let people = root.join("people.jsonl");
    let mut file = std::fs::File::create(&people).unwrap();
    for record in &records {
        writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
    }

    Fixture {
        _dir: dir,
        root,
        settings,
        people,
        records,
    }
}

fn run(fixture: &Fixture, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_linkage"))
        .args(args)
        .arg("--settings")
        .arg(&fixture.settings)
        .arg("--input")
        .arg(format!("people={}", fixture.people.display()))
        .output()
        .unwrap()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn count_prints_the_pre_filter_count() {
    let fixture = fixture();
    let output = run(&fixture, &["count", "--rule", "l.surname = r.surname"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let expected: u64 = value_counts(&fixture.records, "surname").values().map(|n| n * n).sum();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.trim(), expected.to_string());
}

#[test]
fn cumulative_prints_json_records() {
    let fixture = fixture();
    let output = run(&fixture, &["cumulative"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = value.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["rule"], "l.first_name = r.first_name");
    assert!(rows[0]["reduction_ratio"].as_f64().unwrap() > 0.0);
}

#[test]
fn estimate_u_then_train_writes_artifacts() {
    let fixture = fixture();
    let model = fixture.root.join("model.json");
    let output = run(
        &fixture,
        &["estimate-u", "--target-rows", "2000", "--out", path_arg(&model)],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let trained = Settings::from_json_str(&std::fs::read_to_string(&model).unwrap()).unwrap();
    assert!(trained
        .comparisons
        .iter()
        .all(|c| c.levels_excluding_null().all(|l| !l.trained_u_probabilities.is_empty())));

    let history = fixture.root.join("history.json");
    let args = ["train", "--rule", "l.city = r.city", "--out", path_arg(&history)];
    let output = run(&fixture, &args);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let loaded = ParameterHistory::load_from_json_file(&history).unwrap();
    assert!(!loaded.historical_params.is_empty());

    // A second run refuses to replace the artifact without --overwrite.
    let output = run(&fixture, &args);
    assert!(!output.status.success());
    let mut overwrite = args.to_vec();
    overwrite.push("--overwrite");
    let output = run(&fixture, &overwrite);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn training_on_an_empty_rule_fails() {
    let fixture = fixture();
    let history = fixture.root.join("history.json");
    let output = run(&fixture, &["train", "--rule", "1=0", "--out", path_arg(&history)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("1=0"));
    assert!(!history.exists());
}
