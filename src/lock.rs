//! Named locks stored in the `semaphore` table.
//!
//! Each kernel owns a random lock id. A lock row records the owner id and an
//! absolute expiry; a lock whose expiry has passed may be taken over by any
//! other request.

use crate::db::connection::Connection;
use crate::error::KernelResult;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shortest lock lifetime accepted by [`LockService::acquire`], in seconds.
const MIN_TIMEOUT: f64 = 0.001;

/// Default [`LockService::wait`] delay, in seconds.
pub const DEFAULT_WAIT_DELAY: f64 = 30.0;

/// Current time as fractional Unix seconds.
pub fn microtime() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug)]
pub struct LockService {
    lock_id: String,
    held: HashSet<String>,
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService {
    pub fn new() -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            held: HashSet::new(),
        }
    }

    /// Identifier written into every lock row this service owns.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains(name)
    }

    /// Acquire (or extend) a lock for `timeout` seconds.
    pub async fn acquire(&mut self, conn: &Connection, name: &str, timeout: f64) -> KernelResult<bool> {
        let timeout = timeout.max(MIN_TIMEOUT);
        let expire = microtime() + timeout;

        if self.held.contains(name) {
            let extended = conn
                .execute(
                    "UPDATE {semaphore} SET expire = ? WHERE name = ? AND value = ?",
                    &[expire.into(), name.into(), self.lock_id.as_str().into()],
                )
                .await?;
            if extended == 0 {
                // Someone else took it over after it expired.
                self.held.remove(name);
            }
            return Ok(extended > 0);
        }

        let mut retry = false;
        loop {
            let inserted = conn
                .execute(
                    "INSERT INTO {semaphore} (name, value, expire) VALUES (?, ?, ?)",
                    &[name.into(), self.lock_id.as_str().into(), expire.into()],
                )
                .await;
            match inserted {
                Ok(_) => {
                    debug!(name, lock_id = %self.lock_id, timeout, "Lock acquired");
                    self.held.insert(name.to_string());
                    return Ok(true);
                }
                Err(e) if e.is_integrity_violation() => {
                    // Clearing an expired row earns exactly one more attempt.
                    if retry || !self.may_be_available(conn, name).await? {
                        return Ok(false);
                    }
                    retry = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether `name` looks free. An expired lock row is deleted on the way.
    pub async fn may_be_available(&self, conn: &Connection, name: &str) -> KernelResult<bool> {
        let Some(row) = conn
            .query_row(
                "SELECT expire, value FROM {semaphore} WHERE name = ?",
                &[name.into()],
            )
            .await?
        else {
            return Ok(true);
        };

        let expire = match row.get("expire") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
            Some(Value::String(s)) => s.parse().unwrap_or_default(),
            _ => 0.0,
        };
        let owner = row.get("value").and_then(Value::as_str).unwrap_or_default();

        if microtime() > expire {
            // Only the row we looked at may go; a fresh owner must survive.
            let deleted = conn
                .execute(
                    "DELETE FROM {semaphore} WHERE name = ? AND value = ? AND expire = ?",
                    &[name.into(), owner.into(), expire.into()],
                )
                .await?;
            return Ok(deleted > 0);
        }
        Ok(false)
    }

    /// Poll until `name` may be available or `delay` seconds pass.
    ///
    /// Returns `false` once the lock looks free, `true` if the wait timed out.
    pub async fn wait(&self, conn: &Connection, name: &str, delay: f64) -> KernelResult<bool> {
        let mut remaining = Duration::from_secs_f64(delay.max(0.0));
        let mut sleep = Duration::from_millis(25);
        let cap = Duration::from_millis(500);

        while !remaining.is_zero() {
            let step = sleep.min(remaining);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);

            if self.may_be_available(conn, name).await? {
                return Ok(false);
            }
            sleep = (sleep + Duration::from_millis(25)).min(cap);
        }
        warn!(name, delay, "Timed out waiting for lock");
        Ok(true)
    }

    pub async fn release(&mut self, conn: &Connection, name: &str) -> KernelResult<()> {
        self.held.remove(name);
        conn.execute(
            "DELETE FROM {semaphore} WHERE name = ? AND value = ?",
            &[name.into(), self.lock_id.as_str().into()],
        )
        .await?;
        debug!(name, "Lock released");
        Ok(())
    }

    /// Release every lock owned by this service.
    pub async fn release_all(&mut self, conn: &Connection) -> KernelResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        self.held.clear();
        conn.execute(
            "DELETE FROM {semaphore} WHERE value = ?",
            &[self.lock_id.as_str().into()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::Driver;
    use crate::db::info::ConnectionOptions;
    use crate::db::schema;

    async fn connection() -> Connection {
        let options = ConnectionOptions::sqlite_memory();
        let pool = Driver::Sqlite.connect(&options).await.unwrap();
        let conn = Connection::new("default", "default", pool, options.prefix);
        schema::install(&conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let conn = connection().await;
        let mut a = LockService::new();
        let mut b = LockService::new();

        assert!(a.acquire(&conn, "rebuild", 30.0).await.unwrap());
        assert!(!b.acquire(&conn, "rebuild", 30.0).await.unwrap());
        // Re-acquiring extends the lock.
        assert!(a.acquire(&conn, "rebuild", 30.0).await.unwrap());

        a.release(&conn, "rebuild").await.unwrap();
        assert!(b.acquire(&conn, "rebuild", 30.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let conn = connection().await;
        let mut a = LockService::new();
        let mut b = LockService::new();

        assert!(a.acquire(&conn, "cron", 0.0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.acquire(&conn, "cron", 30.0).await.unwrap());

        // The old owner cannot extend a lock it lost.
        assert!(!a.acquire(&conn, "cron", 30.0).await.unwrap());
        assert!(!a.is_held("cron"));
    }

    #[tokio::test]
    async fn test_wait_returns_false_when_free() {
        let conn = connection().await;
        let lock = LockService::new();
        assert!(!lock.wait(&conn, "nothing", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let conn = connection().await;
        let mut a = LockService::new();
        a.acquire(&conn, "busy", 30.0).await.unwrap();
        let b = LockService::new();
        assert!(b.wait(&conn, "busy", 0.06).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all() {
        let conn = connection().await;
        let mut a = LockService::new();
        a.acquire(&conn, "one", 30.0).await.unwrap();
        a.acquire(&conn, "two", 30.0).await.unwrap();
        a.release_all(&conn).await.unwrap();

        let mut b = LockService::new();
        assert!(b.acquire(&conn, "one", 30.0).await.unwrap());
        assert!(b.acquire(&conn, "two", 30.0).await.unwrap());
    }
}
