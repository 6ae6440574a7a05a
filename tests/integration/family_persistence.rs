#![allow(missing_docs)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use markov_estimator::graph::{ObservedTransition, START_VERTEX};
use markov_estimator::{
    ClassificationId, GraphFamily, MarkovError, MarkovGraph, PartitionId, PartitionSet,
    ProcedureId, Schema, VertexKey,
};
use serde_json::Value;
use tempfile::TempDir;

fn schema() -> Schema {
    Schema::new("bank")
        .procedure("Transfer", &["Read", "Write"])
        .procedure("Audit", &["Scan"])
}

fn parts(ids: &[u32]) -> PartitionSet {
    ids.iter().copied().map(PartitionId).collect()
}

fn observe(graph: &MarkovGraph, from: &VertexKey, to: &VertexKey, times: usize) {
    for _ in 0..times {
        graph
            .add_observed_transition(&ObservedTransition::new(
                from.clone(),
                to.clone(),
                Duration::from_micros(3),
            ))
            .expect("observe");
    }
}

fn populated(schema: &Schema) -> GraphFamily {
    let transfer = schema.procedure_id("Transfer").expect("transfer");
    let audit = schema.procedure_id("Audit").expect("audit");
    let read = schema.statement_id(transfer, "Read").expect("read");
    let write = schema.statement_id(transfer, "Write").expect("write");
    let scan = schema.statement_id(audit, "Scan").expect("scan");

    let family = GraphFamily::new();
    family.set_feature_keys(transfer, ["from_account", "to_account"]);
    for id in [7, 0, 3] {
        let graph = family.get_or_create(ClassificationId(id), transfer);
        let p = id as u32;
        let r = VertexKey::query(read, parts(&[p]), 0);
        let w = VertexKey::query(write, parts(&[p, p + 1]), 0);
        observe(&graph, &VertexKey::start(), &r, 5);
        observe(&graph, &r, &w, 4);
        observe(&graph, &r, &VertexKey::abort(), 1);
        observe(&graph, &w, &VertexKey::commit(), 4);
    }
    let graph = family.get_or_create(ClassificationId(3), audit);
    let s = VertexKey::query(scan, parts(&[0, 1, 2]), 0);
    observe(&graph, &VertexKey::start(), &s, 2);
    observe(&graph, &s, &VertexKey::commit(), 2);
    family
}

#[test]
fn save_then_load_is_structurally_identical() {
    let schema = schema();
    let family = populated(&schema);
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("markov.json");
    family.save(&path, &schema).expect("save");
    assert!(!dir.path().join("markov.json.tmp").exists());

    let loaded = GraphFamily::load(&path, &schema).expect("load");
    assert_eq!(
        loaded.to_document(&schema).expect("document"),
        family.to_document(&schema).expect("document")
    );
    assert_eq!(loaded.classification_ids(), family.classification_ids());
    assert_eq!(loaded.graph_count(), 4);
    let transfer = schema.procedure_id("Transfer").expect("transfer");
    assert_eq!(
        loaded.get_feature_keys(transfer),
        Some(vec!["from_account".to_string(), "to_account".to_string()])
    );
    for (id, graph) in family.graphs() {
        let other = loaded.get(id, graph.procedure()).expect("graph present");
        assert_eq!(other.vertex_count(), graph.vertex_count());
        assert_eq!(other.edge_total(), graph.edge_total());
        assert_eq!(other.outgoing(START_VERTEX), graph.outgoing(START_VERTEX));
    }
}

#[test]
fn classification_ids_serialize_ascending() {
    let schema = schema();
    let json = populated(&schema).to_json_string(&schema).expect("json");
    let doc: Value = serde_json::from_str(&json).expect("parse");
    let keys: Vec<&str> = doc["MARKOVS"]
        .as_object()
        .expect("MARKOVS object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, vec!["0", "3", "7"]);
    assert!(doc["MARKOVS"]["3"]["bank.Audit"].is_object());
    assert_eq!(doc["FEATURES"]["bank.Transfer"][1], "to_account");
    let first = json.find("\"0\"").expect("id 0");
    let last = json.find("\"7\"").expect("id 7");
    assert!(first < last);
}

#[test]
fn missing_sections_fail_fast() {
    let schema = schema();
    let err = GraphFamily::from_json_str(r#"{"FEATURES": {}}"#, &schema).unwrap_err();
    assert!(matches!(err, MarkovError::MissingSection("MARKOVS")));
    let err = GraphFamily::from_json_str(r#"{"MARKOVS": {}}"#, &schema).unwrap_err();
    assert!(matches!(err, MarkovError::MissingSection("FEATURES")));
}

#[test]
fn unresolved_procedure_key_fails() {
    let schema = schema();
    let json = populated(&schema).to_json_string(&schema).expect("json");
    let narrower = Schema::new("bank").procedure("Transfer", &["Read", "Write"]);
    let err = GraphFamily::from_json_str(&json, &narrower).unwrap_err();
    assert!(matches!(
        err,
        MarkovError::UnresolvedKey { kind: "procedure", ref key } if key == "bank.Audit"
    ));
}

#[test]
fn unresolved_statement_key_fails() {
    let schema = schema();
    let json = populated(&schema).to_json_string(&schema).expect("json");
    let renamed = Schema::new("bank")
        .procedure("Transfer", &["Read", "Update"])
        .procedure("Audit", &["Scan"]);
    let err = GraphFamily::from_json_str(&json, &renamed).unwrap_err();
    assert!(matches!(err, MarkovError::UnresolvedKey { kind: "statement", .. }));
}

#[test]
fn dangling_vertex_reference_is_malformed() {
    let schema = schema();
    let json = populated(&schema).to_json_string(&schema).expect("json");
    let mut doc: Value = serde_json::from_str(&json).expect("parse");
    doc["MARKOVS"]["0"]["bank.Transfer"]["edges"][0]["to"] = Value::from(42);
    let err = GraphFamily::from_json_str(&doc.to_string(), &schema).unwrap_err();
    assert!(matches!(err, MarkovError::Malformed(_)));
}

#[test]
fn vertex_unreachable_from_start_is_malformed() {
    let schema = schema();
    let json = populated(&schema).to_json_string(&schema).expect("json");
    let mut doc: Value = serde_json::from_str(&json).expect("parse");
    let graph = &mut doc["MARKOVS"]["3"]["bank.Transfer"];
    graph["vertices"]
        .as_array_mut()
        .expect("vertices")
        .push(serde_json::json!({
            "id": 40,
            "kind": "QUERY",
            "statement": "Write",
            "partitions": [9],
            "round": 0,
            "read_only": true,
            "hits": 0
        }));
    graph["edges"]
        .as_array_mut()
        .expect("edges")
        .push(serde_json::json!({"from": 40, "to": 1, "count": 9, "elapsed_nanos": 0}));
    let err = GraphFamily::from_json_str(&doc.to_string(), &schema).unwrap_err();
    assert!(matches!(err, MarkovError::Malformed(ref m) if m.contains("unreachable")));
}

#[test]
fn failed_reload_leaves_family_untouched() {
    let schema = schema();
    let family = populated(&schema);
    let before = family.to_document(&schema).expect("document");
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.json");
    let mut doc: Value =
        serde_json::from_str(&family.to_json_string(&schema).expect("json")).expect("parse");
    // The last classification id is corrupt; nothing from the earlier ones may land.
    doc["MARKOVS"]["7"]["bank.Transfer"]["vertices"][0]["kind"] = Value::from("COMMIT");
    fs::write(&path, doc.to_string()).expect("write");

    let target = GraphFamily::new();
    target.get_or_create(ClassificationId(99), ProcedureId(0));
    assert!(target.reload(&path, &schema).is_err());
    assert_eq!(target.classification_ids(), vec![ClassificationId(99)]);
    assert_eq!(family.to_document(&schema).expect("document"), before);
}

#[test]
fn reload_swaps_contents_in_place() {
    let schema = schema();
    let family = populated(&schema);
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("markov.json");
    family.save(&path, &schema).expect("save");

    let shared = Arc::new(GraphFamily::new());
    shared.get_or_create(ClassificationId(99), ProcedureId(0));
    shared.reload(&path, &schema).expect("reload");
    assert_eq!(
        shared.classification_ids(),
        vec![ClassificationId(0), ClassificationId(3), ClassificationId(7)]
    );
}

#[test]
fn quarantine_survives_round_trip() {
    let schema = schema();
    let family = populated(&schema);
    let transfer = schema.procedure_id("Transfer").expect("transfer");
    family
        .get(ClassificationId(3), transfer)
        .expect("graph")
        .quarantine("corrupt counters");
    let json = family.to_json_string(&schema).expect("json");
    let loaded = GraphFamily::from_json_str(&json, &schema).expect("load");
    assert!(loaded
        .get(ClassificationId(3), transfer)
        .expect("graph")
        .is_quarantined());
    assert!(!loaded
        .get(ClassificationId(0), transfer)
        .expect("graph")
        .is_quarantined());
}
