//! Live connections.
//!
//! A [`Connection`] wraps the pool opened for one `(key, target)` pair. SQL is
//! written with `{table}` placeholders, which are expanded with the
//! connection's table prefixes, and `?` positional arguments, which are
//! renumbered for drivers that want `$n`.
//!
//! # Architecture
//!
//! Execution is split into database-specific submodules (`mysql`, `postgres`,
//! `sqlite`) with identical interfaces. They are generic over the sqlx
//! executor so that pools and open transactions share the same code.

use crate::db::driver::{DbPool, Driver};
use crate::db::info::TablePrefix;
use crate::db::log::{DatabaseLog, QueryRecord};
use crate::db::params::QueryParam;
use crate::db::transaction::{DbTransaction, Transaction};
use crate::db::types::Row;
use crate::error::{KernelError, KernelResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct Connection {
    /// Changes when the key is renamed in the registry.
    key: RwLock<String>,
    target: String,
    driver: Driver,
    pool: DbPool,
    prefix: TablePrefix,
    logger: RwLock<Option<Arc<DatabaseLog>>>,
    transaction_depth: AtomicUsize,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key())
            .field("target", &self.target)
            .field("driver", &self.driver)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        key: impl Into<String>,
        target: impl Into<String>,
        pool: DbPool,
        prefix: TablePrefix,
    ) -> Self {
        Self {
            key: RwLock::new(key.into()),
            target: target.into(),
            driver: pool.driver(),
            pool,
            prefix,
            logger: RwLock::new(None),
            transaction_depth: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The database key this connection is registered under.
    pub fn key(&self) -> String {
        self.key.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_key(&self, key: &str) {
        *self.key.write().unwrap_or_else(|e| e.into_inner()) = key.to_string();
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn prefix(&self) -> &TablePrefix {
        &self.prefix
    }

    /// Attach or detach the query logger.
    pub fn set_logger(&self, logger: Option<Arc<DatabaseLog>>) {
        *self.logger.write().unwrap_or_else(|e| e.into_inner()) = logger;
    }

    pub fn logger(&self) -> Option<Arc<DatabaseLog>> {
        self.logger.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth.load(Ordering::SeqCst)
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Expand `{table}` placeholders with the table prefixes.
    pub fn prefix_tables(&self, sql: &str) -> String {
        prefix_tables(&self.prefix, sql)
    }

    /// Final SQL as sent to the driver.
    pub(crate) fn prepare(&self, sql: &str) -> String {
        let sql = self.prefix_tables(sql);
        if self.driver.numbered_placeholders() {
            number_placeholders(&sql)
        } else {
            sql
        }
    }

    fn ensure_open(&self) -> KernelResult<()> {
        if self.is_destroyed() {
            return Err(KernelError::connection(
                format!(
                    "Connection {}.{} has been closed",
                    self.key(),
                    self.target
                ),
                "Request the connection again from the registry",
            ));
        }
        Ok(())
    }

    pub(crate) fn log_query(&self, query: &str, args: &[QueryParam], duration: Duration) {
        debug!(
            key = %self.key(),
            target = %self.target,
            sql = %query,
            params = args.len(),
            elapsed_ms = duration.as_millis() as u64,
            "Query executed"
        );
        if let Some(logger) = self.logger() {
            logger.log(QueryRecord {
                query: query.to_string(),
                args: args.to_vec(),
                target: self.target.clone(),
                duration,
            });
        }
    }

    /// Run a query and decode every row.
    pub async fn query(&self, sql: &str, args: &[QueryParam]) -> KernelResult<Vec<Row>> {
        self.ensure_open()?;
        let sql = self.prepare(sql);
        let start = Instant::now();
        let rows = crate::impl_db_dispatch!(&self.pool, {
            MySql(p) => mysql::fetch_rows(p, &sql, args).await,
            Postgres(p) => postgres::fetch_rows(p, &sql, args).await,
            SQLite(p) => sqlite::fetch_rows(p, &sql, args).await,
        })?;
        self.log_query(&sql, args, start.elapsed());
        Ok(rows)
    }

    /// Run a query and return its first row.
    pub async fn query_row(&self, sql: &str, args: &[QueryParam]) -> KernelResult<Option<Row>> {
        Ok(self.query(sql, args).await?.into_iter().next())
    }

    /// Run a query and return the first column of its first row.
    pub async fn query_value(
        &self,
        sql: &str,
        args: &[QueryParam],
    ) -> KernelResult<Option<serde_json::Value>> {
        Ok(self
            .query_row(sql, args)
            .await?
            .and_then(|row| row.into_iter().next().map(|(_, value)| value)))
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, args: &[QueryParam]) -> KernelResult<u64> {
        self.ensure_open()?;
        let sql = self.prepare(sql);
        let start = Instant::now();
        let affected = crate::impl_db_dispatch!(&self.pool, {
            MySql(p) => mysql::execute(p, &sql, args).await,
            Postgres(p) => postgres::execute(p, &sql, args).await,
            SQLite(p) => sqlite::execute(p, &sql, args).await,
        })?;
        self.log_query(&sql, args, start.elapsed());
        Ok(affected)
    }

    /// Begin a transaction on a dedicated connection from the pool.
    pub async fn transaction(&self) -> KernelResult<Transaction<'_>> {
        self.ensure_open()?;
        let inner = match &self.pool {
            DbPool::MySql(p) => DbTransaction::MySql(p.begin().await?),
            DbPool::Postgres(p) => DbTransaction::Postgres(p.begin().await?),
            DbPool::SQLite(p) => DbTransaction::SQLite(p.begin().await?),
        };
        let depth = self.transaction_depth.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(key = %self.key(), target = %self.target, depth, "Transaction started");
        Ok(Transaction::new(self, inner))
    }

    pub(crate) fn end_transaction(&self) {
        let _ = self
            .transaction_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }

    /// Close the pool. Any later query on this connection fails.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_logger(None);
        self.pool.close().await;
        info!(key = %self.key(), target = %self.target, "Connection closed");
    }
}

/// Expand `{table}` placeholders. Braces around anything other than a table
/// name are left alone.
pub fn prefix_tables(prefix: &TablePrefix, sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_table_name(&after[..close]) => {
                let table = &after[..close];
                out.push_str(prefix.for_table(table));
                out.push_str(table);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Rewrite `?` placeholders as `$1`, `$2`, ... outside of quoted literals.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_quote = false;
    let mut n = 0;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

pub(crate) mod mysql {
    use crate::db::params::{QueryParam, bind_mysql_param};
    use crate::db::types::{Row, RowToJson};
    use crate::error::KernelResult;
    use sqlx::{Executor, MySql};

    pub async fn fetch_rows<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<Vec<Row>>
    where
        E: Executor<'c, Database = MySql>,
    {
        // Raw SQL when there is nothing to bind; some statements cannot be prepared.
        let rows = if params.is_empty() {
            exec.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.fetch_all(exec).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<u64>
    where
        E: Executor<'c, Database = MySql>,
    {
        let result = if params.is_empty() {
            exec.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.execute(exec).await?
        };
        Ok(result.rows_affected())
    }
}

pub(crate) mod postgres {
    use crate::db::params::{QueryParam, bind_postgres_param};
    use crate::db::types::{Row, RowToJson};
    use crate::error::KernelResult;
    use sqlx::{Executor, Postgres};

    pub async fn fetch_rows<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<Vec<Row>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let rows = if params.is_empty() {
            exec.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.fetch_all(exec).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let result = if params.is_empty() {
            exec.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.execute(exec).await?
        };
        Ok(result.rows_affected())
    }
}

pub(crate) mod sqlite {
    use crate::db::params::{QueryParam, bind_sqlite_param};
    use crate::db::types::{Row, RowToJson};
    use crate::error::KernelResult;
    use sqlx::{Executor, Sqlite};

    pub async fn fetch_rows<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<Vec<Row>>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let rows = if params.is_empty() {
            exec.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.fetch_all(exec).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(exec: E, sql: &str, params: &[QueryParam]) -> KernelResult<u64>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            exec.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.execute(exec).await?
        };
        Ok(result.rows_affected())
    }
}
