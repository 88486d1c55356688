//! Database drivers.
//!
//! Driver identifiers from settings resolve through a fixed table to the
//! [`Driver`] sum type; each driver knows how to build its connect options and
//! open a database-specific pool (MySqlPool, PgPool, SqlitePool) so that full
//! type support is kept.

use crate::db::info::ConnectionOptions;
use crate::error::{KernelError, KernelResult};
use serde::Serialize;
use sqlx::{
    MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions, mysql::MySqlPoolOptions,
    postgres::PgConnectOptions, postgres::PgPoolOptions, sqlite::SqliteConnectOptions,
    sqlite::SqlitePoolOptions,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Includes MariaDB
    MySql,
    Pgsql,
    Sqlite,
}

/// Registered driver identifiers.
const DRIVERS: &[(&str, Driver)] = &[
    ("mysql", Driver::MySql),
    ("pgsql", Driver::Pgsql),
    ("sqlite", Driver::Sqlite),
];

impl Driver {
    /// Resolve a driver identifier from settings.
    pub fn from_name(name: &str) -> Option<Self> {
        DRIVERS
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(name))
            .map(|(_, driver)| *driver)
    }

    /// The identifier used in settings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Pgsql => "pgsql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Get the display name for this driver.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Pgsql => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this driver.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::Pgsql => Some(5432),
            Self::Sqlite => None,
        }
    }

    /// Whether the driver uses numbered (`$1`) rather than positional (`?`) placeholders.
    pub fn numbered_placeholders(&self) -> bool {
        matches!(self, Self::Pgsql)
    }

    /// Open a pool for the given descriptor.
    pub async fn connect(&self, options: &ConnectionOptions) -> KernelResult<DbPool> {
        let pool_opts = &options.pool;
        let is_sqlite = *self == Driver::Sqlite;
        let acquire_timeout = Duration::from_secs(pool_opts.acquire_timeout_or_default());
        let idle_timeout = Some(Duration::from_secs(pool_opts.idle_timeout_or_default()));
        let max_connections = pool_opts.max_connections_or_default(is_sqlite);
        let min_connections = pool_opts.min_connections_or_default().min(max_connections);

        debug!(
            driver = self.name(),
            database = %options.database,
            max_connections,
            "Opening connection pool"
        );

        match self {
            Driver::MySql => {
                let mut connect = MySqlConnectOptions::new()
                    .host(options.host.as_deref().unwrap_or("localhost"))
                    .port(options.port.or(self.default_port()).unwrap_or(3306))
                    .database(&options.database)
                    .charset(extra_str(options, "charset").unwrap_or("utf8mb4"));
                if let Some(username) = &options.username {
                    connect = connect.username(username);
                }
                if let Some(password) = &options.password {
                    connect = connect.password(password);
                }

                let pool = MySqlPoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect_with(connect)
                    .await
                    .map_err(|e| {
                        KernelError::connection(
                            format!("Failed to connect: {}", e),
                            self.connection_suggestion(&e),
                        )
                    })?;
                Ok(DbPool::MySql(pool))
            }
            Driver::Pgsql => {
                let mut connect = PgConnectOptions::new()
                    .host(options.host.as_deref().unwrap_or("localhost"))
                    .port(options.port.or(self.default_port()).unwrap_or(5432))
                    .database(&options.database);
                if let Some(username) = &options.username {
                    connect = connect.username(username);
                }
                if let Some(password) = &options.password {
                    connect = connect.password(password);
                }

                let pool = PgPoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .connect_with(connect)
                    .await
                    .map_err(|e| {
                        KernelError::connection(
                            format!("Failed to connect: {}", e),
                            self.connection_suggestion(&e),
                        )
                    })?;
                Ok(DbPool::Postgres(pool))
            }
            Driver::Sqlite => {
                let url = format!("sqlite:{}", options.database);
                let connect = SqliteConnectOptions::from_str(&url)
                    .map_err(|e| {
                        KernelError::connection(
                            format!("Invalid SQLite database path: {}", e),
                            "Use a file path or :memory: as the database",
                        )
                    })?
                    .create_if_missing(true);

                // An in-memory database lives as long as its connection, so the
                // pool must never drop its only connection.
                let in_memory = options.database == ":memory:";
                let idle_timeout = if in_memory { None } else { idle_timeout };
                let pool = SqlitePoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(if in_memory { 1 } else { max_connections })
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
                    .connect_with(connect)
                    .await
                    .map_err(|e| {
                        KernelError::connection(
                            format!("Failed to connect: {}", e),
                            self.connection_suggestion(&e),
                        )
                    })?;
                Ok(DbPool::SQLite(pool))
            }
        }
    }

    /// Generate a helpful suggestion for connection errors.
    fn connection_suggestion(&self, error: &sqlx::Error) -> String {
        let error_str = error.to_string().to_lowercase();

        if error_str.contains("connection refused") {
            return format!(
                "Check that the {} server is running and accessible",
                self.display_name()
            );
        }

        if error_str.contains("authentication") || error_str.contains("password") {
            return "Verify the username and password for this connection".to_string();
        }

        if error_str.contains("does not exist") || error_str.contains("unknown database") {
            return "Check that the database name exists".to_string();
        }

        match self {
            Driver::Pgsql => "Verify host, port and database for the pgsql connection".to_string(),
            Driver::MySql => "Verify host, port and database for the mysql connection".to_string(),
            Driver::Sqlite => {
                "Verify the file path exists and is writable by the web server".to_string()
            }
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn extra_str<'a>(options: &'a ConnectionOptions, name: &str) -> Option<&'a str> {
    options.extra.get(name).and_then(|v| v.as_str())
}

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::MySql(pool) => pool.is_closed(),
            DbPool::Postgres(pool) => pool.is_closed(),
            DbPool::SQLite(pool) => pool.is_closed(),
        }
    }

    /// Get the driver for this pool.
    pub fn driver(&self) -> Driver {
        match self {
            DbPool::MySql(_) => Driver::MySql,
            DbPool::Postgres(_) => Driver::Pgsql,
            DbPool::SQLite(_) => Driver::Sqlite,
        }
    }
}

/// Macro for generating pool dispatch match arms.
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::driver::DbPool::$variant($p) => $body,
            )+
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_name() {
        assert_eq!(Driver::from_name("mysql"), Some(Driver::MySql));
        assert_eq!(Driver::from_name("pgsql"), Some(Driver::Pgsql));
        assert_eq!(Driver::from_name("SQLite"), Some(Driver::Sqlite));
        assert_eq!(Driver::from_name("oracle"), None);
        assert_eq!(Driver::from_name(""), None);
    }

    #[test]
    fn test_driver_names_round_trip_through_table() {
        for (name, driver) in DRIVERS {
            assert_eq!(driver.name(), *name);
        }
    }

    #[test]
    fn test_placeholder_style() {
        assert!(Driver::Pgsql.numbered_placeholders());
        assert!(!Driver::MySql.numbered_placeholders());
        assert!(!Driver::Sqlite.numbered_placeholders());
    }

    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let pool = Driver::Sqlite
            .connect(&ConnectionOptions::sqlite_memory())
            .await
            .unwrap();
        assert_eq!(pool.driver(), Driver::Sqlite);
        assert!(!pool.is_closed());
        pool.close().await;
        assert!(pool.is_closed());
    }
}
