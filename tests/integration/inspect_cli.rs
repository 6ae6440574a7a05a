#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use markov_estimator::graph::ObservedTransition;
use markov_estimator::{ClassificationId, GraphFamily, PartitionId, PartitionSet, Schema, VertexKey};
use serde_json::Value;
use tempfile::TempDir;

const SCHEMA_TOML: &str = r#"
database = "bank"

[[procedures]]
name = "Transfer"
statements = ["Read", "Write"]
"#;

fn setup() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let catalog = dir.path().join("schema.toml");
    fs::write(&catalog, SCHEMA_TOML).expect("write schema");
    let schema = Schema::from_toml_str(SCHEMA_TOML).expect("schema");

    let transfer = schema.procedure_id("Transfer").expect("transfer");
    let read = schema.statement_id(transfer, "Read").expect("read");
    let family = GraphFamily::new();
    let graph = family.get_or_create(ClassificationId(2), transfer);
    let r = VertexKey::query(read, PartitionSet::single(PartitionId(2)), 0);
    for (from, to, n) in [
        (VertexKey::start(), r.clone(), 4),
        (r.clone(), VertexKey::commit(), 3),
        (r, VertexKey::abort(), 1),
    ] {
        for _ in 0..n {
            graph
                .add_observed_transition(&ObservedTransition::new(
                    from.clone(),
                    to.clone(),
                    Duration::from_micros(1),
                ))
                .expect("observe");
        }
    }
    let artifact = dir.path().join("markov.json");
    family.save(&artifact, &schema).expect("save");
    (dir, catalog, artifact)
}

#[test]
fn summary_reports_graphs_as_json() {
    let (_dir, catalog, artifact) = setup();
    let output = cargo_bin_cmd!("markov-inspect")
        .args(["--format", "json", "--catalog"])
        .arg(&catalog)
        .arg("summary")
        .arg(&artifact)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["classifications"], 1);
    let graph = &json["graphs"][0];
    assert_eq!(graph["procedure"], "bank.Transfer");
    assert_eq!(graph["classification"], 2);
    assert_eq!(graph["observations"], 4);
    assert_eq!(graph["estimate"]["partitions"], serde_json::json!([2]));
    assert_eq!(graph["estimate"]["single_partition"], true);
}

#[test]
fn summary_text_mentions_procedure() {
    let (_dir, catalog, artifact) = setup();
    let output = cargo_bin_cmd!("markov-inspect")
        .arg("summary")
        .arg(&artifact)
        .env("MARKOV_CATALOG", &catalog)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("bank.Transfer"));
    assert!(text.contains("observations=4"));
}

#[test]
fn verify_succeeds_on_valid_artifact() {
    let (_dir, catalog, artifact) = setup();
    let output = cargo_bin_cmd!("markov-inspect")
        .args(["--format", "json", "verify"])
        .arg(&artifact)
        .arg("--catalog")
        .arg(&catalog)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], true);
    assert_eq!(json["graphs"], 1);
    assert_eq!(json["vertices"], 4);
    assert_eq!(json["edges"], 3);
}

#[test]
fn verify_rejects_missing_section() {
    let (dir, catalog, _) = setup();
    let broken = dir.path().join("broken.json");
    fs::write(&broken, r#"{"FEATURES": {}}"#).expect("write");
    cargo_bin_cmd!("markov-inspect")
        .arg("verify")
        .arg(&broken)
        .arg("--catalog")
        .arg(&catalog)
        .assert()
        .failure()
        .code(1);
}

#[test]
fn missing_catalog_is_an_error() {
    let (_dir, _, artifact) = setup();
    cargo_bin_cmd!("markov-inspect")
        .arg("summary")
        .arg(&artifact)
        .env_remove("MARKOV_CATALOG")
        .assert()
        .failure();
}
