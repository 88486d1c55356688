//! Per-key query logging.
//!
//! A [`DatabaseLog`] belongs to one database key and is shared by every
//! connection opened under that key. Queries are attributed to every logging
//! session that is active when they run; a session must be started before it
//! collects anything.

use crate::db::params::QueryParam;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One executed query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    /// The query after table prefixing.
    pub query: String,
    pub args: Vec<QueryParam>,
    /// The target whose connection ran the query.
    pub target: String,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct DatabaseLog {
    key: String,
    sessions: Mutex<HashMap<String, Vec<QueryRecord>>>,
}

impl DatabaseLog {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The database key this log collects for.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Vec<QueryRecord>>> {
        // A panic while appending cannot leave a record half-written.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a named session. Starting an already active session keeps its records.
    pub fn start(&self, logging_key: &str) {
        self.sessions().entry(logging_key.to_string()).or_default();
    }

    /// Records collected so far by a session.
    pub fn get(&self, logging_key: &str) -> Vec<QueryRecord> {
        self.sessions()
            .get(logging_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Empty a session without ending it.
    pub fn clear(&self, logging_key: &str) {
        if let Some(records) = self.sessions().get_mut(logging_key) {
            records.clear();
        }
    }

    /// End a session and drop its records.
    pub fn end(&self, logging_key: &str) {
        self.sessions().remove(logging_key);
    }

    pub fn is_active(&self, logging_key: &str) -> bool {
        self.sessions().contains_key(logging_key)
    }

    /// Attribute a query to every active session.
    pub fn log(&self, record: QueryRecord) {
        let mut sessions = self.sessions();
        if sessions.is_empty() {
            return;
        }
        for records in sessions.values_mut() {
            records.push(record.clone());
        }
    }
}
