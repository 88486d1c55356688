//! Transactions on a [`Connection`].
//!
//! A transaction holds a dedicated pooled connection until it is committed or
//! rolled back. Dropping an unfinished transaction rolls it back.

use crate::db::connection::{Connection, mysql, postgres, sqlite};
use crate::db::driver::Driver;
use crate::db::params::QueryParam;
use crate::db::types::Row;
use crate::error::{KernelError, KernelResult};
use sqlx::{MySql, Postgres, Sqlite};
use std::time::Instant;
use tracing::{debug, warn};

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(sqlx::Transaction<'static, MySql>),
    Postgres(sqlx::Transaction<'static, Postgres>),
    SQLite(sqlx::Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn driver(&self) -> Driver {
        match self {
            DbTransaction::MySql(_) => Driver::MySql,
            DbTransaction::Postgres(_) => Driver::Pgsql,
            DbTransaction::SQLite(_) => Driver::Sqlite,
        }
    }

    pub async fn commit(self) -> KernelResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(KernelError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(KernelError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(KernelError::from),
        }
    }

    pub async fn rollback(self) -> KernelResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(KernelError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(KernelError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(KernelError::from),
        }
    }
}

pub struct Transaction<'c> {
    connection: &'c Connection,
    inner: Option<DbTransaction>,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(connection: &'c Connection, inner: DbTransaction) -> Self {
        Self {
            connection,
            inner: Some(inner),
        }
    }

    pub fn connection(&self) -> &Connection {
        self.connection
    }

    fn inner(&mut self) -> KernelResult<&mut DbTransaction> {
        let (key, target) = (self.connection.key(), self.connection.target().to_string());
        self.inner
            .as_mut()
            .ok_or_else(|| KernelError::transaction("Transaction already finished", key, target))
    }

    pub async fn query(&mut self, sql: &str, args: &[QueryParam]) -> KernelResult<Vec<Row>> {
        let sql = self.connection.prepare(sql);
        let start = Instant::now();
        let rows = match self.inner()? {
            DbTransaction::MySql(tx) => mysql::fetch_rows(&mut **tx, &sql, args).await?,
            DbTransaction::Postgres(tx) => postgres::fetch_rows(&mut **tx, &sql, args).await?,
            DbTransaction::SQLite(tx) => sqlite::fetch_rows(&mut **tx, &sql, args).await?,
        };
        self.connection.log_query(&sql, args, start.elapsed());
        Ok(rows)
    }

    pub async fn execute(&mut self, sql: &str, args: &[QueryParam]) -> KernelResult<u64> {
        let sql = self.connection.prepare(sql);
        let start = Instant::now();
        let affected = match self.inner()? {
            DbTransaction::MySql(tx) => mysql::execute(&mut **tx, &sql, args).await?,
            DbTransaction::Postgres(tx) => postgres::execute(&mut **tx, &sql, args).await?,
            DbTransaction::SQLite(tx) => sqlite::execute(&mut **tx, &sql, args).await?,
        };
        self.connection.log_query(&sql, args, start.elapsed());
        Ok(affected)
    }

    pub async fn commit(mut self) -> KernelResult<()> {
        let inner = self.inner.take();
        self.connection.end_transaction();
        match inner {
            Some(tx) => {
                tx.commit().await?;
                debug!(key = %self.connection.key(), target = %self.connection.target(), "Transaction committed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn rollback(mut self) -> KernelResult<()> {
        let inner = self.inner.take();
        self.connection.end_transaction();
        match inner {
            Some(tx) => {
                tx.rollback().await?;
                debug!(key = %self.connection.key(), target = %self.connection.target(), "Transaction rolled back");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            self.connection.end_transaction();
            warn!(
                key = %self.connection.key(),
                target = %self.connection.target(),
                "Transaction dropped without commit; rolling back"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::info::ConnectionOptions;

    async fn connection() -> Connection {
        let options = ConnectionOptions::sqlite_memory();
        let pool = Driver::Sqlite.connect(&options).await.unwrap();
        let conn = Connection::new("default", "default", pool, options.prefix);
        conn.execute("CREATE TABLE {t} (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let conn = connection().await;
        let mut tx = conn.transaction().await.unwrap();
        assert_eq!(conn.transaction_depth(), 1);
        tx.execute("INSERT INTO {t} (id) VALUES (?)", &[1i64.into()])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(conn.transaction_depth(), 0);

        let rows = conn.query("SELECT id FROM {t}", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let conn = connection().await;
        let mut tx = conn.transaction().await.unwrap();
        tx.execute("INSERT INTO {t} (id) VALUES (?)", &[1i64.into()])
            .await
            .unwrap();
        let inside = tx.query("SELECT id FROM {t}", &[]).await.unwrap();
        assert_eq!(inside.len(), 1);
        tx.rollback().await.unwrap();

        let rows = conn.query("SELECT id FROM {t}", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_drop_resets_depth() {
        let conn = connection().await;
        {
            let _tx = conn.transaction().await.unwrap();
            assert!(conn.in_transaction());
        }
        assert!(!conn.in_transaction());
    }
}
