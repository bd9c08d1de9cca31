//! Immutable telemetry snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Timestamped field map, built once and consumed by a single dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder {
            created_at: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

pub struct SnapshotBuilder {
    created_at: DateTime<Utc>,
    fields: BTreeMap<String, Value>,
}

impl SnapshotBuilder {
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        // the timestamp is not a free-form field
        if name != "created_at" {
            self.fields.insert(name, value.into());
        }
        self
    }

    pub fn build(self) -> Snapshot {
        Snapshot {
            created_at: self.created_at,
            fields: self.fields,
        }
    }
}
