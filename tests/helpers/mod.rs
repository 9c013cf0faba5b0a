#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use trackio::codec::{MetricValue, Metrics};
use trackio::store::ProjectStore;

/// A fresh store rooted in a unique temp directory, isolated per test.
pub fn test_store() -> Arc<ProjectStore> {
    Arc::new(ProjectStore::new(test_dir()))
}

pub fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trackio-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create test dir");
    dir
}

/// Build a metrics mapping from float pairs.
pub fn metrics(pairs: &[(&str, f64)]) -> Metrics {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetricValue::Float(*v)))
        .collect()
}

/// Build an encoded-JSON metrics object from float pairs (store-level tests).
pub fn encoded(pairs: &[(&str, f64)]) -> serde_json::Value {
    let map: BTreeMap<&str, f64> = pairs.iter().copied().collect();
    serde_json::to_value(map).expect("encode test metrics")
}

/// Extract a float metric from a decoded row, unwrapping ints too.
pub fn float_of(row: &Metrics, key: &str) -> f64 {
    match row.get(key) {
        Some(MetricValue::Float(f)) => *f,
        Some(MetricValue::Int(i)) => *i as f64,
        other => panic!("metric {key} is not numeric: {other:?}"),
    }
}

pub fn step_of(row: &Metrics) -> i64 {
    match row.get("step") {
        Some(MetricValue::Int(s)) => *s,
        other => panic!("row has no step: {other:?}"),
    }
}
