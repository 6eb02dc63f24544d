//! Process-wide key/value store shared by the orchestrator and its modules.
//!
//! Values are JSON so modules can publish arbitrary payloads. Every write
//! takes the lock for the duration of a single map operation; readers get
//! cloned values and never observe a torn write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Current pulse count, written by the pulse dispatcher.
pub const TICK_KEY: &str = "tick";
/// Host vitals published by modules.
pub const VITALS_KEY: &str = "vitals";
/// RFC 3339 boot timestamp.
pub const BOOT_TIME_KEY: &str = "boot_time";
/// Root filesystem usage, refreshed by pulse housekeeping.
pub const DISK_USAGE_KEY: &str = "disk_usage";

/// Keys only the core writes. Generic writes to them are refused.
pub const RESERVED_KEYS: &[&str] = &[TICK_KEY, BOOT_TIME_KEY, DISK_USAGE_KEY];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Store `value` under `key`. Returns `false`, leaving the store
    /// untouched, when `key` is reserved for the core.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if is_reserved(&key) {
            refuse(&key);
            return false;
        }
        self.inner.write().insert(key, value.into());
        true
    }

    /// Reserved keys cannot be removed.
    pub fn remove(&self, key: &str) -> Option<Value> {
        if is_reserved(key) {
            refuse(key);
            return None;
        }
        self.inner.write().remove(key)
    }

    /// Merge several entries under one write lock. Reserved keys are
    /// skipped; returns how many entries were written.
    pub fn update<I, K>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut guard = self.inner.write();
        let mut written = 0;
        for (key, value) in entries {
            let key = key.into();
            if is_reserved(&key) {
                refuse(&key);
                continue;
            }
            guard.insert(key, value);
            written += 1;
        }
        written
    }

    fn write_reserved(&self, key: &str, value: Value) {
        self.inner.write().insert(key.to_string(), value);
    }

    /// Point-in-time copy of every entry, sorted by key.
    pub fn snapshot(&self) -> Map<String, Value> {
        let guard = self.inner.read();
        let mut keys: Vec<&String> = guard.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| (k.clone(), guard[k].clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn tick(&self) -> u64 {
        self.get(TICK_KEY).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub(crate) fn publish_tick(&self, tick: u64) {
        self.write_reserved(TICK_KEY, Value::from(tick));
    }

    /// Vitals map, empty when nothing has been published yet.
    pub fn vitals(&self) -> Map<String, Value> {
        match self.get(VITALS_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Merge `readings` into the vitals map.
    pub fn publish_vitals(&self, readings: Map<String, Value>) {
        let mut guard = self.inner.write();
        let entry = guard
            .entry(VITALS_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(current) => current.extend(readings),
            other => *other = Value::Object(readings),
        }
    }

    pub fn boot_time(&self) -> Option<DateTime<Utc>> {
        self.get(BOOT_TIME_KEY)
            .and_then(|v| v.as_str().map(str::to_owned))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub(crate) fn set_boot_time(&self, at: DateTime<Utc>) {
        self.write_reserved(BOOT_TIME_KEY, Value::from(at.to_rfc3339()));
    }

    pub fn disk_usage(&self) -> Option<DiskUsage> {
        self.get(DISK_USAGE_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub(crate) fn publish_disk_usage(&self, usage: &DiskUsage) {
        match serde_json::to_value(usage) {
            Ok(value) => self.write_reserved(DISK_USAGE_KEY, value),
            Err(e) => warn!(category = "state", error = %e, "Could not encode disk usage"),
        }
    }
}

fn refuse(key: &str) {
    warn!(category = "state", key = %key, "Refusing write to reserved state key");
}

/// Space used on the root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl DiskUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }

    /// `12GB used / 100GB`
    pub fn summary(&self) -> String {
        const GIB: u64 = 1024 * 1024 * 1024;
        format!("{}GB used / {}GB", self.used_bytes / GIB, self.total_bytes / GIB)
    }
}
