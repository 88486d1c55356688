//! Database cache backend. One table per bin, created by the system schema.

use crate::cache::{CacheItem, Expire};
use crate::db::connection::Connection;
use crate::db::params::QueryParam;
use crate::db::types::Row;
use crate::error::{KernelError, KernelResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DatabaseCache {
    bin: String,
    connection: Arc<Connection>,
    request_time: i64,
}

impl DatabaseCache {
    pub fn new(bin: impl Into<String>, connection: Arc<Connection>, request_time: i64) -> Self {
        Self {
            bin: bin.into(),
            connection,
            request_time,
        }
    }

    fn table(&self) -> String {
        format!("{{{}}}", self.bin)
    }

    pub async fn get_multiple(&self, cids: &[String]) -> KernelResult<HashMap<String, CacheItem>> {
        if cids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; cids.len()].join(", ");
        let sql = format!(
            "SELECT cid, data, created, expire FROM {} WHERE cid IN ({})",
            self.table(),
            placeholders
        );
        let args: Vec<QueryParam> = cids.iter().map(|cid| cid.as_str().into()).collect();

        let rows = self.connection.query(&sql, &args).await?;
        let mut items = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(item) = prepare_item(&row)? {
                items.insert(item.cid.clone(), item);
            }
        }
        Ok(items)
    }

    /// Replace an entry.
    pub async fn set(&self, cid: &str, data: Value, expire: Expire) -> KernelResult<()> {
        let serialized = serde_json::to_string(&data)?;
        let mut tx = self.connection.transaction().await?;
        tx.execute(
            &format!("DELETE FROM {} WHERE cid = ?", self.table()),
            &[cid.into()],
        )
        .await?;
        tx.execute(
            &format!(
                "INSERT INTO {} (cid, data, created, expire) VALUES (?, ?, ?, ?)",
                self.table()
            ),
            &[
                cid.into(),
                serialized.into(),
                self.request_time.into(),
                i64::from(expire).into(),
            ],
        )
        .await?;
        tx.commit().await
    }

    pub async fn clear(&self, cid: Option<&str>, wildcard: bool) -> KernelResult<()> {
        let table = self.table();
        match cid {
            None => {
                self.connection
                    .execute(
                        &format!("DELETE FROM {table} WHERE expire <> ? AND expire < ?"),
                        &[0i64.into(), self.request_time.into()],
                    )
                    .await?;
            }
            Some("*") if wildcard => {
                self.connection
                    .execute(&format!("DELETE FROM {table}"), &[])
                    .await?;
            }
            Some(prefix) if wildcard => {
                // Compared with SUBSTR rather than LIKE so ids need no escaping.
                let len = prefix.chars().count() as i64;
                self.connection
                    .execute(
                        &format!("DELETE FROM {table} WHERE SUBSTR(cid, 1, ?) = ?"),
                        &[len.into(), prefix.into()],
                    )
                    .await?;
            }
            Some(cid) => {
                self.connection
                    .execute(&format!("DELETE FROM {table} WHERE cid = ?"), &[cid.into()])
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn is_empty(&self) -> KernelResult<bool> {
        let row = self
            .connection
            .query_row(&format!("SELECT 1 AS present FROM {} LIMIT 1", self.table()), &[])
            .await?;
        Ok(row.is_none())
    }
}

fn int_column(row: &Row, name: &str) -> i64 {
    match row.get(name) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

/// Decode a row; entries without data are treated as misses.
fn prepare_item(row: &Row) -> KernelResult<Option<CacheItem>> {
    let Some(cid) = row.get("cid").and_then(Value::as_str) else {
        return Ok(None);
    };
    let data = match row.get("data") {
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
            KernelError::internal(format!("Corrupt cache entry {cid}: {e}"))
        })?,
        _ => return Ok(None),
    };
    Ok(Some(CacheItem {
        cid: cid.to_string(),
        data,
        created: int_column(row, "created"),
        expire: Expire::from(int_column(row, "expire")),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::Driver;
    use crate::db::info::ConnectionOptions;
    use crate::db::schema;
    use serde_json::json;

    async fn cache(bin: &str, now: i64) -> DatabaseCache {
        let options = ConnectionOptions::sqlite_memory();
        let pool = Driver::Sqlite.connect(&options).await.unwrap();
        let conn = Arc::new(Connection::new("default", "default", pool, options.prefix));
        schema::install(&conn).await.unwrap();
        DatabaseCache::new(bin, conn, now)
    }

    #[tokio::test]
    async fn test_set_get_replace() {
        let cache = cache("cache", 1000).await;
        cache
            .set("k", json!({"a": [1, 2]}), Expire::Permanent)
            .await
            .unwrap();
        cache.set("k", json!("second"), Expire::Temporary).await.unwrap();

        let found = cache.get_multiple(&["k".to_string()]).await.unwrap();
        let item = &found["k"];
        assert_eq!(item.data, json!("second"));
        assert_eq!(item.created, 1000);
        assert_eq!(item.expire, Expire::Temporary);
    }

    #[tokio::test]
    async fn test_general_clear() {
        let cache = cache("cache", 1000).await;
        cache.set("permanent", json!(1), Expire::Permanent).await.unwrap();
        cache.set("temporary", json!(1), Expire::Temporary).await.unwrap();
        cache.set("expired", json!(1), Expire::At(999)).await.unwrap();
        cache.set("future", json!(1), Expire::At(5000)).await.unwrap();

        cache.clear(None, false).await.unwrap();

        let cids: Vec<String> = ["permanent", "temporary", "expired", "future"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut found: Vec<String> = cache.get_multiple(&cids).await.unwrap().into_keys().collect();
        found.sort();
        assert_eq!(found, vec!["future", "permanent"]);
    }

    #[tokio::test]
    async fn test_prefix_clear_and_truncate() {
        let cache = cache("cache_page", 1).await;
        cache.set("http://a/x", json!(1), Expire::Permanent).await.unwrap();
        cache.set("http://a/y", json!(1), Expire::Permanent).await.unwrap();
        cache.set("http://b/x", json!(1), Expire::Permanent).await.unwrap();

        cache.clear(Some("http://a/"), true).await.unwrap();
        assert!(!cache.is_empty().await.unwrap());
        let left = cache
            .get_multiple(&["http://a/x".to_string(), "http://b/x".to_string()])
            .await
            .unwrap();
        assert_eq!(left.len(), 1);

        cache.clear(Some("*"), true).await.unwrap();
        assert!(cache.is_empty().await.unwrap());
    }
}
