//! Connection descriptors and the connection-info table.
//!
//! Settings describe databases as `databases[key][target]`. A target is either a
//! single descriptor or a list of interchangeable replicas; parsing collapses
//! every target to exactly one normalized [`ConnectionOptions`].

use crate::config::PoolOptions;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The target every key must provide, and the fallback for unknown targets.
pub const DEFAULT_TARGET: &str = "default";

/// The key used when no key is specified.
pub const DEFAULT_KEY: &str = "default";

/// Table prefixes for one connection, always carrying a `default` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PrefixSpec")]
pub struct TablePrefix(BTreeMap<String, String>);

/// Prefix as written in settings: one string for all tables, or a per-table map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PrefixSpec {
    All(String),
    PerTable(BTreeMap<String, String>),
}

impl From<PrefixSpec> for TablePrefix {
    fn from(spec: PrefixSpec) -> Self {
        match spec {
            PrefixSpec::All(prefix) => Self::from(prefix),
            PrefixSpec::PerTable(mut map) => {
                map.entry("default".to_string()).or_default();
                Self(map)
            }
        }
    }
}

impl From<String> for TablePrefix {
    fn from(prefix: String) -> Self {
        let mut map = BTreeMap::new();
        map.insert("default".to_string(), prefix);
        Self(map)
    }
}

impl From<&str> for TablePrefix {
    fn from(prefix: &str) -> Self {
        Self::from(prefix.to_string())
    }
}

impl Default for TablePrefix {
    fn default() -> Self {
        Self::from(String::new())
    }
}

impl TablePrefix {
    /// Prefix applied to tables without their own entry.
    pub fn default_prefix(&self) -> &str {
        self.0.get("default").map(String::as_str).unwrap_or_default()
    }

    /// Prefix for one table.
    pub fn for_table(&self, table: &str) -> &str {
        self.0
            .get(table)
            .map(String::as_str)
            .unwrap_or_else(|| self.default_prefix())
    }

    /// Replace the default prefix, keeping per-table entries.
    pub fn set_default(&mut self, prefix: impl Into<String>) {
        self.0.insert("default".to_string(), prefix.into());
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Descriptor for one `(key, target)` connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Driver identifier: `mysql`, `pgsql` or `sqlite`. Empty means unspecified.
    #[serde(default)]
    pub driver: String,
    /// Database name, or file path for SQLite.
    #[serde(default)]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Contains sensitive data - never log
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub prefix: TablePrefix,
    #[serde(default)]
    pub pool: PoolOptions,
    /// Driver-specific options passed through as URL query parameters.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConnectionOptions {
    pub fn new(driver: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// In-memory SQLite descriptor, mostly useful for tests.
    pub fn sqlite_memory() -> Self {
        Self::new("sqlite", ":memory:")
    }

    pub fn with_prefix(mut self, prefix: impl Into<TablePrefix>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// A target as written in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    /// A single connection descriptor.
    Single(ConnectionOptions),
    /// Interchangeable replicas; one is picked at parse time.
    Replicas(Vec<ConnectionOptions>),
}

impl TargetSpec {
    /// Collapse to one descriptor, choosing a replica uniformly at random.
    ///
    /// The choice is made once, when the table is parsed, and is not revisited
    /// for the lifetime of the registry. An empty replica list yields a
    /// descriptor without a driver.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> ConnectionOptions {
        match self {
            TargetSpec::Single(options) => options.clone(),
            TargetSpec::Replicas(replicas) if replicas.is_empty() => ConnectionOptions::default(),
            TargetSpec::Replicas(replicas) => {
                let index = rng.gen_range(0..replicas.len());
                replicas[index].clone()
            }
        }
    }
}

/// `databases[key][target]` as written in settings.
pub type RawDatabaseInfo = BTreeMap<String, BTreeMap<String, TargetSpec>>;

/// Parsed and normalized `databases[key][target]`.
pub type DatabaseInfo = BTreeMap<String, BTreeMap<String, ConnectionOptions>>;

/// Parse a raw table, resolving replica lists.
pub fn parse_database_info<R: Rng + ?Sized>(raw: &RawDatabaseInfo, rng: &mut R) -> DatabaseInfo {
    raw.iter()
        .map(|(key, targets)| {
            let targets = targets
                .iter()
                .map(|(target, spec)| (target.clone(), spec.resolve(rng)))
                .collect();
            (key.clone(), targets)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_prefix_string_normalized_to_map() {
        let options: ConnectionOptions =
            serde_json::from_str(r#"{"driver": "mysql", "prefix": "site_"}"#).unwrap();
        assert_eq!(options.prefix.default_prefix(), "site_");
        assert_eq!(options.prefix.for_table("users"), "site_");
        assert_eq!(options.prefix.entries().len(), 1);
    }

    #[test]
    fn test_prefix_map_gets_default_entry() {
        let options: ConnectionOptions =
            serde_json::from_str(r#"{"driver": "mysql", "prefix": {"users": "shared_"}}"#)
                .unwrap();
        assert_eq!(options.prefix.default_prefix(), "");
        assert_eq!(options.prefix.for_table("users"), "shared_");
        assert_eq!(options.prefix.for_table("node"), "");
    }

    #[test]
    fn test_missing_prefix_defaults_to_empty() {
        let options: ConnectionOptions = serde_json::from_str(r#"{"driver": "sqlite"}"#).unwrap();
        assert_eq!(options.prefix, TablePrefix::default());
        assert_eq!(options.prefix.default_prefix(), "");
    }

    #[test]
    fn test_extra_options_are_preserved() {
        let options: ConnectionOptions =
            serde_json::from_str(r#"{"driver": "mysql", "charset": "utf8mb4"}"#).unwrap();
        assert_eq!(
            options.extra.get("charset"),
            Some(&serde_json::Value::String("utf8mb4".to_string()))
        );
    }

    #[test]
    fn test_target_spec_array_is_replicas() {
        let spec: TargetSpec = serde_json::from_str(
            r#"[{"driver": "mysql", "host": "a"}, {"driver": "mysql", "host": "b"}]"#,
        )
        .unwrap();
        assert!(matches!(spec, TargetSpec::Replicas(ref r) if r.len() == 2));

        let mut rng = StdRng::seed_from_u64(7);
        let chosen = spec.resolve(&mut rng);
        assert!(matches!(chosen.host.as_deref(), Some("a") | Some("b")));
    }

    #[test]
    fn test_empty_replica_list_has_no_driver() {
        let spec = TargetSpec::Replicas(Vec::new());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(spec.resolve(&mut rng).driver.is_empty());
    }

    #[test]
    fn test_parse_database_info() {
        let raw: RawDatabaseInfo = serde_json::from_str(
            r#"{"default": {
                "default": {"driver": "sqlite", "database": ":memory:"},
                "slave": [{"driver": "sqlite", "database": "r1"}, {"driver": "sqlite", "database": "r2"}]
            }}"#,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let info = parse_database_info(&raw, &mut rng);
        let targets = &info["default"];
        assert_eq!(targets["default"].database, ":memory:");
        assert!(["r1", "r2"].contains(&targets["slave"].database.as_str()));
    }

    #[test]
    fn test_password_not_serialized() {
        let mut options = ConnectionOptions::new("mysql", "site");
        options.password = Some("secret".to_string());
        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("secret"));
    }
}
