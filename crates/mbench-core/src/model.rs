//! Ledger data model: a `Study` owns an append-only list of `Run`s, each of
//! which maps benchmark config filenames to a `BenchmarkResult`.
//!
//! Field names on disk follow the historical study files. Every record keeps
//! the keys it does not understand in `extra` so older and newer tools can
//! share a ledger without dropping data.

use chrono::{Local, NaiveDateTime, Timelike};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// Local wall-clock time truncated to microseconds, the resolution the ledger stores.
pub fn now_timestamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.with_nanosecond(micros).unwrap_or(now)
}

/// `a.json` -> `a`; names without a stem are returned unchanged.
pub fn config_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| name.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub name: String,
    pub core_version: String,
    #[serde(rename = "benchmark_runner_version")]
    pub runner_version: String,
    pub creation_date: NaiveDateTime,
    #[serde(rename = "shared_private_key_path")]
    pub shared_key_path: String,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(rename = "additional_notes", default)]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Study {
    pub fn new(
        name: impl Into<String>,
        core_version: impl Into<String>,
        runner_version: impl Into<String>,
        shared_key_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            core_version: core_version.into(),
            runner_version: runner_version.into(),
            creation_date: now_timestamp(),
            shared_key_path: shared_key_path.into(),
            runs: Vec::new(),
            notes: String::new(),
            extra: Map::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(rename = "runner_config")]
    pub runner_config_path: String,
    #[serde(default)]
    pub runner_config_contents: Value,
    #[serde(rename = "date")]
    pub started_at: NaiveDateTime,
    #[serde(default)]
    pub benchmarks: BenchmarkSet,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Run {
    pub fn new(
        runner_config_path: impl Into<String>,
        runner_config_contents: Value,
        started_at: NaiveDateTime,
    ) -> Self {
        Self {
            runner_config_path: runner_config_path.into(),
            runner_config_contents,
            started_at,
            benchmarks: BenchmarkSet::default(),
            extra: Map::new(),
        }
    }

    /// `YYYY-MM-DD` of the run start, used in blob keys and sync directory names.
    pub fn date_label(&self) -> String {
        self.started_at.format("%Y-%m-%d").to_string()
    }

    pub fn success_count(&self) -> usize {
        self.benchmarks
            .iter()
            .filter(|(_, b)| b.status == BenchmarkStatus::Success)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkStatus {
    Success,
    Failed,
}

impl BenchmarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkStatus::Success => "success",
            BenchmarkStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub source: String,
    #[serde(rename = "results", default)]
    pub results_uri: String,
    #[serde(rename = "logs", default)]
    pub logs_uri: String,
    pub status: BenchmarkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BenchmarkResult {
    pub fn success(source: impl Into<String>, results: &BlobRef, logs: &BlobRef) -> Self {
        Self {
            source: source.into(),
            results_uri: results.uri(),
            logs_uri: logs.uri(),
            status: BenchmarkStatus::Success,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            results_uri: String::new(),
            logs_uri: String::new(),
            status: BenchmarkStatus::Failed,
            error: Some(error.into()),
            extra: Map::new(),
        }
    }
}

/// Benchmark results keyed by config filename, iterated in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkSet {
    entries: Vec<(String, BenchmarkResult)>,
}

impl BenchmarkSet {
    /// Inserts at the end, or replaces in place when the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, result: BenchmarkResult) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = result,
            None => self.entries.push((name, result)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BenchmarkResult> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BenchmarkResult)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for BenchmarkSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, result) in &self.entries {
            map.serialize_entry(name, result)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for BenchmarkSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = BenchmarkSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of benchmark name to result")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut set = BenchmarkSet::default();
                while let Some((name, result)) = access.next_entry::<String, BenchmarkResult>()? {
                    set.insert(name, result);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(SetVisitor)
    }
}

/// Blob address. Rendered as `s3://{bucket}/{key}` in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Accepts any `scheme://bucket/key`; bucket and key must be non-empty.
    pub fn parse(uri: &str) -> Option<Self> {
        let (_, rest) = uri.split_once("://")?;
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}
