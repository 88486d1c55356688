//! Persistent site variables.
//!
//! Variables live in the `variable` table as JSON documents. The whole table
//! is cached as one entry in `cache_bootstrap`; rebuilding that entry is
//! guarded by the `variable_init` lock so concurrent cache misses do not all
//! hit the table at once. Settings overrides (`conf`) always win.

use crate::cache::{Cache, Expire};
use crate::db::connection::Connection;
use crate::error::KernelResult;
use crate::lock::{DEFAULT_WAIT_DELAY, LockService};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Cache id of the variable table in `cache_bootstrap`.
pub const CACHE_ID: &str = "variables";
const LOCK_NAME: &str = "variable_init";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Load variables, apply `conf` overrides on top.
    pub async fn initialize(
        conf: &BTreeMap<String, Value>,
        cache: &Cache,
        conn: &Connection,
        locks: &mut LockService,
    ) -> KernelResult<Self> {
        let mut values = loop {
            if let Some(item) = cache.get(CACHE_ID).await? {
                break decode_table(item.data);
            }

            let acquired = locks.acquire(conn, LOCK_NAME, 1.0).await?;
            if !acquired {
                let wait = conf
                    .get("variable_initialize_wait_for_lock")
                    .is_some_and(is_truthy);
                if wait {
                    debug!("Variable cache is being rebuilt elsewhere, waiting");
                    locks.wait(conn, LOCK_NAME, DEFAULT_WAIT_DELAY).await?;
                    continue;
                }
            }

            let values = load_table(conn).await?;
            if acquired {
                let data = Value::Object(values.clone().into_iter().collect());
                cache.set(CACHE_ID, data, Expire::Permanent).await?;
                locks.release(conn, LOCK_NAME).await?;
            }
            break values;
        };

        for (name, value) in conf {
            values.insert(name.clone(), value.clone());
        }
        debug!(count = values.len(), "Variables initialized");
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Deserialize a variable, falling back to `default` when it is unset or
    /// has the wrong shape.
    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.values
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// Loose truthiness: `0`, `"0"`, `""`, empty arrays and objects are false.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.values.get(name).map(is_truthy).unwrap_or(default)
    }

    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        match self.values.get(name) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => default,
        }
    }

    /// Set a value for this request only.
    pub fn set_override(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Persist a variable and drop the cached table.
    pub async fn set(
        &mut self,
        conn: &Connection,
        cache: &Cache,
        name: &str,
        value: Value,
    ) -> KernelResult<()> {
        let serialized = serde_json::to_string(&value)?;
        let mut tx = conn.transaction().await?;
        tx.execute("DELETE FROM {variable} WHERE name = ?", &[name.into()])
            .await?;
        tx.execute(
            "INSERT INTO {variable} (name, value) VALUES (?, ?)",
            &[name.into(), serialized.into()],
        )
        .await?;
        tx.commit().await?;

        cache.clear(Some(CACHE_ID), false).await?;
        self.values.insert(name.to_string(), value);
        debug!(name, "Variable set");
        Ok(())
    }

    pub async fn del(&mut self, conn: &Connection, cache: &Cache, name: &str) -> KernelResult<()> {
        conn.execute("DELETE FROM {variable} WHERE name = ?", &[name.into()])
            .await?;
        cache.clear(Some(CACHE_ID), false).await?;
        self.values.remove(name);
        debug!(name, "Variable deleted");
        Ok(())
    }
}

/// Loose truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn decode_table(data: Value) -> BTreeMap<String, Value> {
    match data {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

async fn load_table(conn: &Connection) -> KernelResult<BTreeMap<String, Value>> {
    let rows = conn.query("SELECT name, value FROM {variable}", &[]).await?;
    let mut values = BTreeMap::new();
    for row in rows {
        let (Some(Value::String(name)), Some(Value::String(raw))) = (row.get("name"), row.get("value"))
        else {
            continue;
        };
        match serde_json::from_str(raw) {
            Ok(value) => {
                values.insert(name.clone(), value);
            }
            Err(e) => warn!(name = %name, error = %e, "Skipping unreadable variable"),
        }
    }
    Ok(values)
}

impl From<Map<String, Value>> for Variables {
    fn from(map: Map<String, Value>) -> Self {
        Self::new(map.into_iter().collect())
    }
}
