//! Bin-keyed cache.
//!
//! Each bin resolves its backend once per request from the `cache_class_<bin>`
//! variable, falling back to `cache_default_class` and then to the database
//! backend. Values are stored as JSON.
//!
//! Expiry follows the usual wipe semantics: `get` does not filter on expiry;
//! a general `clear(None)` removes temporary entries and entries whose
//! expiry has passed, and permanent entries stay until cleared by id.

pub mod database;
pub mod memory;

use crate::db::registry::Database;
use crate::db::info::DEFAULT_TARGET;
use crate::error::{KernelError, KernelResult};
use crate::variable::Variables;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

pub use database::DatabaseCache;
pub use memory::MemoryCache;

/// Backend used when no class variable is set.
pub const DEFAULT_CACHE_CLASS: &str = "DatabaseCache";

/// Cache entry lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Expire {
    /// Kept until cleared by id.
    Permanent,
    /// Dropped by the next general wipe.
    Temporary,
    /// Dropped by a general wipe after this Unix timestamp.
    At(i64),
}

impl From<i64> for Expire {
    fn from(value: i64) -> Self {
        match value {
            0 => Expire::Permanent,
            -1 => Expire::Temporary,
            ts => Expire::At(ts),
        }
    }
}

impl From<Expire> for i64 {
    fn from(expire: Expire) -> Self {
        match expire {
            Expire::Permanent => 0,
            Expire::Temporary => -1,
            Expire::At(ts) => ts,
        }
    }
}

impl Expire {
    /// Whether a general wipe at `now` drops the entry.
    pub fn is_wipeable(self, now: i64) -> bool {
        let value = i64::from(self);
        value != 0 && value < now
    }
}

/// A cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    pub cid: String,
    pub data: Value,
    /// Unix timestamp of the write.
    pub created: i64,
    pub expire: Expire,
}

/// Registered backend classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Database,
    Memory,
    Null,
}

impl CacheClass {
    /// Resolve a class name from a `cache_class_*` variable.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DatabaseCache" | "DrupalDatabaseCache" => Some(Self::Database),
            "MemoryCache" => Some(Self::Memory),
            "NullCache" | "DrupalFakeCache" => Some(Self::Null),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Database => "DatabaseCache",
            Self::Memory => "MemoryCache",
            Self::Null => "NullCache",
        }
    }
}

/// A bin that never stores anything.
#[derive(Debug, Clone)]
pub struct NullCache;

#[derive(Debug, Clone)]
pub enum CacheBackend {
    Database(DatabaseCache),
    Memory(MemoryCache),
    Null(NullCache),
}

/// Handle on one bin. Cheap to clone; clones share the backend.
#[derive(Debug, Clone)]
pub struct Cache {
    bin: String,
    backend: CacheBackend,
}

/// Whether a table name is a cache bin that may be emptied wholesale.
pub fn is_valid_bin(bin: &str) -> bool {
    bin == "cache" || bin.starts_with("cache_")
}

impl Cache {
    pub fn new(bin: impl Into<String>, backend: CacheBackend) -> Self {
        Self {
            bin: bin.into(),
            backend,
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn class(&self) -> CacheClass {
        match self.backend {
            CacheBackend::Database(_) => CacheClass::Database,
            CacheBackend::Memory(_) => CacheClass::Memory,
            CacheBackend::Null(_) => CacheClass::Null,
        }
    }

    pub async fn get(&self, cid: &str) -> KernelResult<Option<CacheItem>> {
        let mut cids = vec![cid.to_string()];
        Ok(self.get_multiple(&mut cids).await?.remove(cid))
    }

    /// Fetch several entries. Found ids are removed from `cids`, leaving the misses.
    pub async fn get_multiple(
        &self,
        cids: &mut Vec<String>,
    ) -> KernelResult<HashMap<String, CacheItem>> {
        let found = match &self.backend {
            CacheBackend::Database(c) => c.get_multiple(cids).await?,
            CacheBackend::Memory(c) => c.get_multiple(cids),
            CacheBackend::Null(_) => HashMap::new(),
        };
        cids.retain(|cid| !found.contains_key(cid));
        Ok(found)
    }

    pub async fn set(&self, cid: &str, data: Value, expire: Expire) -> KernelResult<()> {
        debug!(bin = %self.bin, cid, "Cache set");
        match &self.backend {
            CacheBackend::Database(c) => c.set(cid, data, expire).await,
            CacheBackend::Memory(c) => {
                c.set(cid, data, expire);
                Ok(())
            }
            CacheBackend::Null(_) => Ok(()),
        }
    }

    /// Clear entries.
    ///
    /// - `None`: drop temporary and expired entries.
    /// - `Some(cid)`: drop one entry, or with `wildcard` every entry whose id
    ///   starts with `cid`; `*` with `wildcard` empties the bin.
    pub async fn clear(&self, cid: Option<&str>, wildcard: bool) -> KernelResult<()> {
        if cid == Some("*") && wildcard && !is_valid_bin(&self.bin) {
            return Err(KernelError::invalid_input(format!(
                "Invalid or missing cache bin specified: {}",
                self.bin
            )));
        }
        debug!(bin = %self.bin, cid = ?cid, wildcard, "Cache clear");
        match &self.backend {
            CacheBackend::Database(c) => c.clear(cid, wildcard).await,
            CacheBackend::Memory(c) => {
                c.clear(cid, wildcard);
                Ok(())
            }
            CacheBackend::Null(_) => Ok(()),
        }
    }

    pub async fn is_empty(&self) -> KernelResult<bool> {
        match &self.backend {
            CacheBackend::Database(c) => c.is_empty().await,
            CacheBackend::Memory(c) => Ok(c.is_empty()),
            CacheBackend::Null(_) => Ok(true),
        }
    }
}

/// Per-request bin table.
#[derive(Debug, Default)]
pub struct CacheBins {
    bins: HashMap<String, Cache>,
}

impl CacheBins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend class configured for a bin.
    pub fn configured_class(bin: &str, variables: &Variables) -> KernelResult<CacheClass> {
        let name = variables
            .get_str(&format!("cache_class_{bin}"))
            .or_else(|| variables.get_str("cache_default_class"))
            .unwrap_or(DEFAULT_CACHE_CLASS);
        CacheClass::from_name(name)
            .ok_or_else(|| KernelError::settings(format!("Unknown cache class '{name}' for bin {bin}")))
    }

    /// The bin's cache, instantiating its backend on first use.
    pub async fn get(
        &mut self,
        bin: &str,
        variables: &Variables,
        database: &mut Database,
        request_time: i64,
    ) -> KernelResult<Cache> {
        if let Some(cache) = self.bins.get(bin) {
            return Ok(cache.clone());
        }

        let class = Self::configured_class(bin, variables)?;
        let backend = match class {
            CacheClass::Database => {
                let connection = database.get_connection(DEFAULT_TARGET, None).await?;
                CacheBackend::Database(DatabaseCache::new(bin, connection, request_time))
            }
            CacheClass::Memory => CacheBackend::Memory(MemoryCache::new(request_time)),
            CacheClass::Null => CacheBackend::Null(NullCache),
        };
        debug!(bin, class = class.name(), "Cache backend instantiated");

        let cache = Cache::new(bin, backend);
        self.bins.insert(bin.to_string(), cache.clone());
        Ok(cache)
    }

    /// Forget instantiated backends so the next lookup re-reads the class variables.
    pub fn reset(&mut self) {
        self.bins.clear();
    }
}
