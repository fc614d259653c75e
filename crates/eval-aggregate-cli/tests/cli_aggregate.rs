use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::TempDir;

fn evagg_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_evagg"))
}

fn evagg_output(result_root: &Path, taxonomy: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(evagg_binary_path());
    command
        .arg("--result-root")
        .arg(result_root)
        .arg("--taxonomy")
        .arg(taxonomy);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute evagg command {args:?}: {err}"),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            panic!("failed to create {}: {err}", parent.display());
        }
    }
    if let Err(err) = fs::write(path, body) {
        panic!("failed to write {}: {err}", path.display());
    }
}

fn seed_fixture_tree(root: &Path) -> PathBuf {
    let taxonomy = root.join("column-path-key.csv");
    write_file(
        &taxonomy,
        "column,path,key,max_score\n\
         jcommonsenseqa,llm-jp-eval,jcommonsenseqa,1\n\
         MC,llm-jp-eval,mc,1\n\
         gsm8k,llm-jp-eval,gsm8k.acc,100\n\
         mmlu,llm-jp-eval,mmlu,5\n",
    );

    let run_dir = root
        .join("results/demo-model")
        .join("eval__demo-model__20240101");
    let body = match serde_json::to_string_pretty(&json!({
        "jcommonsenseqa": 0.42,
        "gsm8k": {"acc": 55.0}
    })) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize fixture: {err}"),
    };
    write_file(&run_dir.join("results_20240101.json"), &body);
    taxonomy
}

#[test]
fn aggregate_writes_record_and_prints_it() {
    let tmp = match TempDir::new() {
        Ok(value) => value,
        Err(err) => panic!("failed to create tempdir: {err}"),
    };
    let taxonomy = seed_fixture_tree(tmp.path());
    let result_root = tmp.path().join("results");

    let output = evagg_output(&result_root, &taxonomy, &["aggregate", "--model", "demo-model"]);
    assert!(
        output.status.success(),
        "aggregate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let record = parse_json(&output);
    assert_eq!(record["model"], json!("demo-model"));
    assert_eq!(record["tasks"], json!(["jcommonsenseqa", "MC", "gsm8k", "mmlu"]));
    assert_eq!(record["result"]["jcommonsenseqa"], json!(0.42));
    assert_eq!(record["result"]["MC"], json!(0.42));
    assert_eq!(record["result"]["gsm8k"], json!(0.55));
    assert_eq!(record["result"]["mmlu"], json!(-1.0));
    assert_eq!(record["overall"], json!([0.42, 0.42, 0.55, -1.0]));

    let record_path = result_root.join("demo-model/aggregated_result.json");
    let first = match fs::read(&record_path) {
        Ok(value) => value,
        Err(err) => panic!("missing persisted record: {err}"),
    };

    let rerun = evagg_output(&result_root, &taxonomy, &["aggregate", "--model", "demo-model"]);
    assert!(rerun.status.success());
    let second = match fs::read(&record_path) {
        Ok(value) => value,
        Err(err) => panic!("missing persisted record after rerun: {err}"),
    };
    assert_eq!(first, second, "rerun must be byte-identical");
}

#[test]
fn missing_reports_unresolved_columns() {
    let tmp = match TempDir::new() {
        Ok(value) => value,
        Err(err) => panic!("failed to create tempdir: {err}"),
    };
    let taxonomy = seed_fixture_tree(tmp.path());
    let result_root = tmp.path().join("results");

    let aggregate = evagg_output(&result_root, &taxonomy, &["aggregate", "--model", "demo-model"]);
    assert!(aggregate.status.success());

    let output = evagg_output(&result_root, &taxonomy, &["missing", "--json"]);
    assert!(
        output.status.success(),
        "missing failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let reports = parse_json(&output);
    assert_eq!(
        reports,
        json!([{"model": "demo-model", "missing": ["mmlu"]}])
    );

    let scoped = evagg_output(
        &result_root,
        &taxonomy,
        &["missing", "--model", "demo-model", "--json"],
    );
    assert!(scoped.status.success());
    assert_eq!(parse_json(&scoped), reports);
}

#[test]
fn invalid_taxonomy_is_fatal_before_any_task() {
    let tmp = match TempDir::new() {
        Ok(value) => value,
        Err(err) => panic!("failed to create tempdir: {err}"),
    };
    let taxonomy = tmp.path().join("column-path-key.csv");
    write_file(&taxonomy, "column,path,key,max_score\nMC,llm-jp-eval,mc,1\n");
    let result_root = tmp.path().join("results");

    let output = evagg_output(&result_root, &taxonomy, &["aggregate", "--model", "demo-model"]);
    assert!(!output.status.success());
    assert!(
        !result_root.join("demo-model/aggregated_result.json").exists(),
        "no record may be written when the taxonomy is invalid"
    );
}
