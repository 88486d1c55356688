//! The database registry.
//!
//! [`Database`] is the single source of truth for connection configuration
//! and live connections within one request. It parses the settings' connection
//! table lazily, opens at most one [`Connection`] per `(key, target)` pair, and
//! routes requests for ignored or unconfigured targets to `default`.

use crate::db::connection::Connection;
use crate::db::driver::Driver;
use crate::db::info::{
    ConnectionOptions, DEFAULT_KEY, DEFAULT_TARGET, DatabaseInfo, RawDatabaseInfo, TablePrefix,
    parse_database_info,
};
use crate::db::log::{DatabaseLog, QueryRecord};
use crate::error::{KernelError, KernelResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Database {
    /// The table as written in settings.
    source: RawDatabaseInfo,
    info: DatabaseInfo,
    parsed: bool,
    connections: HashMap<String, HashMap<String, Arc<Connection>>>,
    active_key: String,
    ignored_targets: HashMap<String, HashSet<String>>,
    logs: HashMap<String, Arc<DatabaseLog>>,
    /// Replica selection.
    rng: StdRng,
}

impl Default for Database {
    fn default() -> Self {
        Self::new(RawDatabaseInfo::new())
    }
}

impl Database {
    pub fn new(source: RawDatabaseInfo) -> Self {
        Self::with_rng(source, StdRng::from_entropy())
    }

    /// Create a registry with a seeded replica picker.
    pub fn with_rng(source: RawDatabaseInfo, rng: StdRng) -> Self {
        Self {
            source,
            info: DatabaseInfo::new(),
            parsed: false,
            connections: HashMap::new(),
            active_key: DEFAULT_KEY.to_string(),
            ignored_targets: HashMap::new(),
            logs: HashMap::new(),
            rng,
        }
    }

    /// Replace the settings table. Takes effect at the next (forced) parse.
    pub fn set_connection_source(&mut self, source: RawDatabaseInfo) {
        self.source = source;
    }

    /// Whether settings describe any database at all.
    pub fn has_connection_source(&self) -> bool {
        !self.source.is_empty()
    }

    /// Parse the settings table into the registry.
    ///
    /// Runs once unless `force` is set. Entries already in the registry are
    /// never overwritten, so runtime additions and renames survive a re-parse.
    pub fn parse_connection_info(&mut self, force: bool) {
        if self.parsed && !force {
            return;
        }
        let parsed = parse_database_info(&self.source, &mut self.rng);
        for (key, targets) in parsed {
            let entry = self.info.entry(key).or_default();
            for (target, options) in targets {
                entry.entry(target).or_insert(options);
            }
        }
        self.parsed = true;
        debug!(keys = self.info.len(), "Parsed connection info");
    }

    /// Add a connection descriptor unless `(key, target)` is already configured.
    pub fn add_connection_info(&mut self, key: &str, target: &str, options: ConnectionOptions) {
        self.parse_connection_info(false);
        self.info
            .entry(key.to_string())
            .or_default()
            .entry(target.to_string())
            .or_insert(options);
    }

    /// All targets configured for a key.
    pub fn connection_info(&mut self, key: &str) -> Option<&BTreeMap<String, ConnectionOptions>> {
        self.parse_connection_info(false);
        self.info.get(key)
    }

    pub fn all_connection_info(&mut self) -> &DatabaseInfo {
        self.parse_connection_info(false);
        &self.info
    }

    /// Append a test prefix to every target of a key. Each target ends up with
    /// a single default prefix of its old default prefix plus `test_prefix`.
    ///
    /// Connections already open under the key keep their old prefixes.
    pub fn apply_test_prefix(&mut self, key: &str, test_prefix: &str) {
        self.parse_connection_info(false);
        if let Some(targets) = self.info.get_mut(key) {
            for options in targets.values_mut() {
                let prefix = format!("{}{}", options.prefix.default_prefix(), test_prefix);
                options.prefix = TablePrefix::from(prefix);
            }
        }
    }

    /// The key used when a caller does not name one.
    pub fn active_key(&self) -> &str {
        &self.active_key
    }

    /// Switch the implicit key. Returns the previous key, or `None` when the
    /// new key is not configured.
    pub fn set_active_connection(&mut self, key: &str) -> Option<String> {
        self.parse_connection_info(false);
        if !self.info.contains_key(key) {
            return None;
        }
        Some(std::mem::replace(&mut self.active_key, key.to_string()))
    }

    /// Whether the active key has an open connection.
    pub fn is_active_connection(&self) -> bool {
        self.connections
            .get(&self.active_key)
            .is_some_and(|targets| !targets.is_empty())
    }

    /// Mark a target unusable for the rest of the request.
    pub fn ignore_target(&mut self, key: &str, target: &str) {
        self.ignored_targets
            .entry(key.to_string())
            .or_default()
            .insert(target.to_string());
    }

    pub fn is_target_ignored(&self, key: &str, target: &str) -> bool {
        self.ignored_targets
            .get(key)
            .is_some_and(|targets| targets.contains(target))
    }

    /// Target a request is routed to.
    fn route(&self, key: &str, target: &str) -> String {
        let configured = self
            .info
            .get(key)
            .is_some_and(|targets| targets.contains_key(target));
        if !configured || self.is_target_ignored(key, target) {
            DEFAULT_TARGET.to_string()
        } else {
            target.to_string()
        }
    }

    /// The connection for `(key, target)`, opened on first use.
    ///
    /// `key` defaults to the active key. Ignored and unconfigured targets fall
    /// back to `default`; repeated calls return the same connection.
    pub async fn get_connection(
        &mut self,
        target: &str,
        key: Option<&str>,
    ) -> KernelResult<Arc<Connection>> {
        let key = key.unwrap_or(&self.active_key).to_string();
        self.parse_connection_info(false);
        let target = self.route(&key, target);

        if let Some(conn) = self.connections.get(&key).and_then(|t| t.get(&target)) {
            return Ok(conn.clone());
        }

        let conn = Arc::new(self.open_connection(&key, &target).await?);
        self.connections
            .entry(key)
            .or_default()
            .insert(target, conn.clone());
        Ok(conn)
    }

    /// Open a new, uncached connection for `(key, target)`.
    pub async fn open_connection(&mut self, key: &str, target: &str) -> KernelResult<Connection> {
        self.parse_connection_info(false);

        let targets = self
            .info
            .get(key)
            .ok_or_else(|| KernelError::connection_not_defined(key))?;
        let options = targets
            .get(target)
            .filter(|options| !options.driver.is_empty())
            .ok_or_else(|| KernelError::driver_not_specified(key, target))?;
        let driver = Driver::from_name(&options.driver)
            .ok_or_else(|| KernelError::unknown_driver(&options.driver, key))?;

        let pool = driver.connect(options).await?;
        let conn = Connection::new(key, target, pool, options.prefix.clone());
        if let Some(log) = self.logs.get(key) {
            conn.set_logger(Some(log.clone()));
        }

        info!(key, target, driver = driver.name(), "Connection opened");
        Ok(conn)
    }

    /// Move configuration and open connections from `old` to `new`.
    ///
    /// Returns `false` when `old` is not configured or `new` already is.
    pub fn rename_connection(&mut self, old: &str, new: &str) -> bool {
        self.parse_connection_info(false);
        if !self.info.contains_key(old) || self.info.contains_key(new) {
            return false;
        }

        if let Some(targets) = self.info.remove(old) {
            self.info.insert(new.to_string(), targets);
        }
        if let Some(connections) = self.connections.remove(old) {
            for conn in connections.values() {
                conn.set_key(new);
            }
            self.connections.insert(new.to_string(), connections);
        }

        info!(old, new, "Connection renamed");
        true
    }

    /// Close every connection of a key and drop its configuration.
    pub async fn remove_connection(&mut self, key: &str) -> bool {
        self.parse_connection_info(false);
        if !self.info.contains_key(key) {
            return false;
        }
        self.close_connection(None, Some(key)).await;
        self.info.remove(key);
        info!(key, "Connection removed");
        true
    }

    /// Destroy one target's connection, or all of the key's when `target` is `None`.
    pub async fn close_connection(&mut self, target: Option<&str>, key: Option<&str>) {
        let key = key.unwrap_or(&self.active_key).to_string();
        match target {
            Some(target) => {
                let removed = self
                    .connections
                    .get_mut(&key)
                    .and_then(|targets| targets.remove(target));
                if let Some(conn) = removed {
                    conn.destroy().await;
                }
                if self.connections.get(&key).is_some_and(HashMap::is_empty) {
                    self.connections.remove(&key);
                }
            }
            None => {
                if let Some(targets) = self.connections.remove(&key) {
                    for conn in targets.values() {
                        conn.destroy().await;
                    }
                }
            }
        }
    }

    /// Close every open connection.
    pub async fn close_all(&mut self) {
        for (_, targets) in self.connections.drain() {
            for conn in targets.values() {
                conn.destroy().await;
            }
        }
    }

    /// Start a logging session for a key.
    ///
    /// The key's log is created on first use and attached to its open
    /// connections; connections opened later get it at open time.
    pub fn start_log(&mut self, logging_key: &str, key: &str) -> Arc<DatabaseLog> {
        let log = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(DatabaseLog::new(key)))
            .clone();

        if let Some(targets) = self.connections.get(key) {
            for conn in targets.values() {
                conn.set_logger(Some(log.clone()));
            }
        }

        log.start(logging_key);
        debug!(logging_key, key, "Query logging started");
        log
    }

    /// End a logging session and return what it recorded.
    pub fn get_log(&mut self, logging_key: &str, key: &str) -> Vec<QueryRecord> {
        let Some(log) = self.logs.get(key) else {
            warn!(logging_key, key, "No query log for key");
            return Vec::new();
        };
        let records = log.get(logging_key);
        log.end(logging_key);
        records
    }

    /// Open connections under a key, by target.
    pub fn open_targets(&self, key: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .connections
            .get(key)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::info::TargetSpec;

    fn sqlite_source() -> RawDatabaseInfo {
        let mut targets = BTreeMap::new();
        targets.insert(
            DEFAULT_TARGET.to_string(),
            TargetSpec::Single(ConnectionOptions::sqlite_memory().with_prefix("site_")),
        );
        let mut source = RawDatabaseInfo::new();
        source.insert(DEFAULT_KEY.to_string(), targets);
        source
    }

    fn registry() -> Database {
        Database::with_rng(sqlite_source(), StdRng::seed_from_u64(3))
    }

    #[test]
    fn test_parse_is_lazy_and_normalizes_prefix() {
        let mut db = registry();
        let info = db.connection_info("default").unwrap();
        assert_eq!(info["default"].prefix.default_prefix(), "site_");
    }

    #[test]
    fn test_reparse_keeps_runtime_additions() {
        let mut db = registry();
        db.add_connection_info("extra", "default", ConnectionOptions::sqlite_memory());
        db.parse_connection_info(true);
        assert!(db.connection_info("extra").is_some());
        assert!(db.connection_info("default").is_some());
    }

    #[test]
    fn test_add_connection_info_does_not_overwrite() {
        let mut db = registry();
        db.add_connection_info(
            "default",
            "default",
            ConnectionOptions::new("mysql", "other"),
        );
        assert_eq!(db.connection_info("default").unwrap()["default"].driver, "sqlite");
    }

    #[test]
    fn test_set_active_connection() {
        let mut db = registry();
        db.add_connection_info("other", "default", ConnectionOptions::sqlite_memory());
        assert_eq!(db.set_active_connection("missing"), None);
        assert_eq!(db.active_key(), "default");
        assert_eq!(db.set_active_connection("other"), Some("default".to_string()));
        assert_eq!(db.active_key(), "other");
    }

    #[test]
    fn test_route_falls_back_to_default() {
        let mut db = registry();
        db.add_connection_info("default", "slave", ConnectionOptions::sqlite_memory());
        assert_eq!(db.route("default", "slave"), "slave");
        assert_eq!(db.route("default", "reporting"), "default");
        db.ignore_target("default", "slave");
        assert_eq!(db.route("default", "slave"), "default");
    }

    #[test]
    fn test_apply_test_prefix() {
        let mut db = registry();
        db.apply_test_prefix("default", "simpletest1");
        let info = db.connection_info("default").unwrap();
        assert_eq!(info["default"].prefix.default_prefix(), "site_simpletest1");
        assert_eq!(info["default"].prefix.for_table("users"), "site_simpletest1");
    }

    #[tokio::test]
    async fn test_open_connection_errors() {
        let mut db = registry();
        let err = db.open_connection("missing_key", "default").await.unwrap_err();
        assert!(matches!(err, KernelError::ConnectionNotDefined { .. }));

        db.add_connection_info("nodriver", "default", ConnectionOptions::default());
        let err = db.open_connection("nodriver", "default").await.unwrap_err();
        assert!(matches!(err, KernelError::DriverNotSpecified { .. }));

        db.add_connection_info("odd", "default", ConnectionOptions::new("oracle", "x"));
        let err = db.open_connection("odd", "default").await.unwrap_err();
        assert!(matches!(err, KernelError::UnknownDriver { .. }));
    }

    #[tokio::test]
    async fn test_is_active_connection() {
        let mut db = registry();
        assert!(!db.is_active_connection());
        db.get_connection("default", None).await.unwrap();
        assert!(db.is_active_connection());
        db.close_connection(None, None).await;
        assert!(!db.is_active_connection());
    }
}
