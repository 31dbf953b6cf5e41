//! Payloads exchanged with index nodes.
//!
//! Nodes post a heartbeat every few seconds. The payload may use nested objects
//! (`{"node": {"url": ..}}`) or the flat dotted keys older nodes send
//! (`{"node.url": ..}`); both are accepted. Numeric fields are lenient: a number
//! or a numeric string is used as-is, anything else reads as zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::TaskType;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub uuid: Uuid,
    pub url: String,
    pub search_url: Option<String>,
    pub name: String,
    pub disk_all: i64,
    pub disk_free: i64,
    pub disk_used: i64,
    pub disk_indexed: i64,
    pub task_count: i64,
    pub concurrency: i64,
    pub concurrency_override: Option<i64>,
}

impl Heartbeat {
    pub fn from_value(value: &Value) -> Result<Self> {
        let uuid = lookup(value, "uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("uuid is required"))?;
        let uuid = Uuid::parse_str(uuid.trim())
            .map_err(|_| Error::validation(format!("invalid node uuid: {uuid}")))?;

        let url = lookup_str(value, "node.url")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::validation("node.url is required"))?;

        let concurrency_override = lookup(value, "node.concurrency_override")
            .filter(|v| !v.is_null())
            .map(lenient_i64);

        Ok(Self {
            uuid,
            url,
            search_url: lookup_str(value, "node.search_url").filter(|u| !u.trim().is_empty()),
            name: lookup_str(value, "node.name").unwrap_or_default(),
            disk_all: lookup_i64(value, "disk.all"),
            disk_free: lookup_i64(value, "disk.free"),
            disk_used: lookup_i64(value, "disk.used"),
            disk_indexed: lookup_i64(value, "disk.indexed"),
            task_count: lookup_i64(value, "node.task_count"),
            concurrency: lookup_i64(value, "node.concurrency"),
            concurrency_override,
        })
    }
}

/// Resolves `a.b` either as a flat key or as a nested path.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = value.get(path) {
        return Some(v);
    }
    path.split('.').try_fold(value, |current, key| current.get(key))
}

fn lookup_str(value: &Value, path: &str) -> Option<String> {
    lookup(value, path).and_then(Value::as_str).map(str::to_string)
}

fn lookup_i64(value: &Value, path: &str) -> i64 {
    lookup(value, path).map(lenient_i64).unwrap_or(0)
}

fn lenient_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Result of one task as reported by the node that ran it.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCallback {
    pub name: CallbackKind,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub payload: CallbackPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Index,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub task_id: i64,
    #[serde(default)]
    pub repo_stats: Option<RepoStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub size_in_bytes: i64,
    #[serde(default)]
    pub index_file_count: i64,
}

/// Task handed to a node in the heartbeat response.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub id: i64,
    pub task_type: TaskType,
    pub project_id: i64,
    pub perform_at: DateTime<Utc>,
    pub repository_id: i64,
    pub index_id: i64,
    pub namespace_id: i64,
}
