//! Store durability across instances.
//!
//! The table store and its trie sidecar persist to disk; a fresh `Store`
//! over the same directory must see everything a previous instance wrote,
//! in the same descending prefix order.

use std::collections::BTreeMap;

use oxn::responses::{MetricRow, ResponseData};
use oxn::store::{Store, construct_key};

fn metric_data(values: &[f64]) -> ResponseData {
    ResponseData::Metrics(
        values
            .iter()
            .enumerate()
            .map(|(index, value)| MetricRow {
                labels: BTreeMap::new(),
                timestamp: index as f64,
                value: *value,
                treatment_labels: BTreeMap::new(),
            })
            .collect(),
    )
}

#[test]
fn tables_survive_a_store_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = metric_data(&[1.0, 2.0, 3.0]);

    {
        let mut store = Store::open(dir.path()).expect("open");
        store
            .write(&data, "experiment.yml", "run1", "latency")
            .expect("write");
    }

    let store = Store::open(dir.path()).expect("reopen");
    let key = construct_key("experiment.yml", "run1", "latency");
    assert_eq!(store.get(&key).expect("get"), data);
    assert_eq!(store.list_for_experiment("experiment.yml"), vec![key]);
}

#[test]
fn prefix_queries_are_descending_after_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut store = Store::open(dir.path()).expect("open");
        for run in ["run1", "run2", "run3"] {
            store
                .write(&metric_data(&[1.0]), "experiment.yml", run, "latency")
                .expect("write");
        }
    }

    let store = Store::open(dir.path()).expect("reopen");
    assert_eq!(
        store.list_for_experiment("experiment.yml"),
        vec![
            "experiment.yml/run3/latency",
            "experiment.yml/run2/latency",
            "experiment.yml/run1/latency",
        ]
    );
    assert_eq!(
        store.list_for_run("experiment.yml", "run2"),
        vec!["experiment.yml/run2/latency"]
    );
}

#[test]
fn consolidation_spans_runs_from_previous_processes() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut store = Store::open(dir.path()).expect("open");
        store
            .write(&metric_data(&[1.0, 2.0]), "experiment.yml", "run1", "latency")
            .expect("write");
    }
    {
        let mut store = Store::open(dir.path()).expect("reopen for second run");
        store
            .write(&metric_data(&[3.0]), "experiment.yml", "run2", "latency")
            .expect("write");
        store
            .write(&metric_data(&[9.0]), "experiment.yml", "run2", "errors")
            .expect("write");
    }

    let store = Store::open(dir.path()).expect("final reopen");
    let consolidated = store
        .consolidate_runs("experiment.yml", "latency")
        .expect("consolidate")
        .expect("has data");
    assert_eq!(consolidated.len(), 3);
}
