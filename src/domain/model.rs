use crate::core::frame::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One row of market data as returned by an API, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    pub data: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_object(obj: serde_json::Map<String, Value>) -> Self {
        Self {
            data: obj.into_iter().collect(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Numeric view of a field. Numeric strings such as `"187.25"` are
    /// accepted because several market APIs quote prices as strings.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    /// A field counts as missing when absent or null.
    pub fn is_missing(&self, key: &str) -> bool {
        matches!(self.data.get(key), None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: String,
    pub url: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub request: FetchRequest,
    pub records: Vec<Record>,
    pub attempts: u32,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFailure {
    pub request: FetchRequest,
    pub error: String,
    pub attempts: u32,
    pub retryable: bool,
}

/// What the fetch stage hands to the processing stage for each request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchBatch),
    Failed(FetchFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub missing: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ProcessedDataset {
    pub frame: Frame,
    pub summary: Vec<ColumnStats>,
    pub dropped_rows: usize,
    pub duplicate_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub requests: usize,
    pub fetched_batches: usize,
    pub failures: Vec<FetchFailure>,
    pub raw_records: usize,
    pub output_rows: usize,
    pub dropped_rows: usize,
    pub duplicate_rows: usize,
    pub outputs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures.len() as f64 / self.requests as f64
        }
    }
}
