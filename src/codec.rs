use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{Result, TrackioError};

/// Maximum nesting the codec will follow before assuming a cycle.
pub const MAX_DEPTH: usize = 128;

/// Keys that collide with the columns folded into query results.
pub const RESERVED_KEYS: [&str; 5] = ["project", "run", "timestamp", "step", "time"];

const INF: &str = "Infinity";
const NEG_INF: &str = "-Infinity";
const NAN: &str = "NaN";

// ---------------------------------------------------------------------------
// Metric values
// ---------------------------------------------------------------------------

/// A loggable value. Unlike `serde_json::Value`, floats may be non-finite;
/// the codec maps those onto quoted string markers so the stored JSON stays
/// valid on every platform.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<MetricValue>),
    Map(BTreeMap<String, MetricValue>),
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // NaN compares equal to NaN: round-trip equality is observational
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl MetricValue {
    /// True when this value is an artifact descriptor (a map carrying `_type`).
    pub fn is_artifact(&self) -> bool {
        matches!(self, Self::Map(m) if m.contains_key("_type"))
    }
}

/// A user-supplied metrics mapping, ordered for stable serialization.
pub type Metrics = BTreeMap<String, MetricValue>;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a metrics mapping into a JSON object safe to store and ship.
///
/// Non-finite floats become the quoted markers `"Infinity"`, `"-Infinity"`,
/// `"NaN"`; everything else is structure-preserving. Artifact descriptors
/// (maps carrying `_type`) pass through unchanged.
pub fn encode_metrics(metrics: &Metrics) -> Result<JsonValue> {
    let mut out = JsonMap::with_capacity(metrics.len());
    for (key, value) in metrics {
        out.insert(key.clone(), encode_value(value, 0)?);
    }
    Ok(JsonValue::Object(out))
}

fn encode_value(value: &MetricValue, depth: usize) -> Result<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(TrackioError::EncodingCycle(MAX_DEPTH));
    }
    Ok(match value {
        MetricValue::Null => JsonValue::Null,
        MetricValue::Bool(b) => JsonValue::Bool(*b),
        MetricValue::Int(i) => JsonValue::from(*i),
        MetricValue::Float(f) => {
            if f.is_nan() {
                JsonValue::from(NAN)
            } else if f.is_infinite() {
                JsonValue::from(if *f > 0.0 { INF } else { NEG_INF })
            } else {
                JsonValue::from(*f)
            }
        }
        MetricValue::Str(s) => JsonValue::from(s.as_str()),
        MetricValue::Seq(items) => JsonValue::Array(
            items
                .iter()
                .map(|v| encode_value(v, depth + 1))
                .collect::<Result<_>>()?,
        ),
        MetricValue::Map(map) => {
            let mut out = JsonMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), encode_value(v, depth + 1)?);
            }
            JsonValue::Object(out)
        }
    })
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a stored JSON object back into a metrics mapping, restoring
/// non-finite floats from their string markers.
pub fn decode_metrics(value: &JsonValue) -> Metrics {
    match value {
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), decode_value(v)))
            .collect(),
        _ => Metrics::new(),
    }
}

fn decode_value(value: &JsonValue) -> MetricValue {
    match value {
        JsonValue::Null => MetricValue::Null,
        JsonValue::Bool(b) => MetricValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetricValue::Int(i)
            } else {
                MetricValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => match s.as_str() {
            INF => MetricValue::Float(f64::INFINITY),
            NEG_INF => MetricValue::Float(f64::NEG_INFINITY),
            NAN => MetricValue::Float(f64::NAN),
            other => MetricValue::Str(other.to_string()),
        },
        JsonValue::Array(items) => MetricValue::Seq(items.iter().map(decode_value).collect()),
        JsonValue::Object(map) => MetricValue::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), decode_value(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Config objects
// ---------------------------------------------------------------------------

/// Build a config mapping from any serializable value.
///
/// The serialized form must be a JSON object; fields whose names begin with
/// `_` are dropped, mirroring the public-attributes rule of the wire format.
pub fn config_object<T: serde::Serialize>(value: &T) -> Result<JsonValue> {
    let serialized = serde_json::to_value(value)?;
    let JsonValue::Object(map) = serialized else {
        return Err(TrackioError::Other(anyhow::anyhow!(
            "config must serialize to an object"
        )));
    };
    Ok(JsonValue::Object(
        map.into_iter().filter(|(k, _)| !k.starts_with('_')).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Key preparation
// ---------------------------------------------------------------------------

/// Validate and repair user metric keys.
///
/// Reserved keys are renamed with a `__` prefix (one warning per call);
/// user-supplied keys that already start with `__` are rejected.
pub fn prepare_keys(metrics: Metrics) -> Result<Metrics> {
    let mut renamed: Vec<String> = Vec::new();
    let mut out = Metrics::new();
    for (key, value) in metrics {
        if key.starts_with("__") {
            return Err(TrackioError::InvalidKey(key));
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            renamed.push(key.clone());
            out.insert(format!("__{key}"), value);
        } else {
            out.insert(key, value);
        }
    }
    if !renamed.is_empty() {
        tracing::warn!(
            keys = renamed.join(", "),
            "reserved metric keys renamed with '__' prefix"
        );
    }
    Ok(out)
}
