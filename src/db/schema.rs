//! System tables.
//!
//! The kernel persists variables, locks, sessions, blocked addresses and
//! cache bins. [`install`] creates whatever is missing; it is safe to run on an
//! installed site.

use crate::db::connection::Connection;
use crate::db::driver::Driver;
use crate::error::KernelResult;
use tracing::info;

/// Cache bins created at install time.
pub const CACHE_BINS: &[&str] = &[
    "cache",
    "cache_bootstrap",
    "cache_page",
    "cache_block",
    "cache_path",
];

// =============================================================================
// SQL Templates
// =============================================================================

mod queries {
    pub const VARIABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS {variable} (
            name VARCHAR(128) NOT NULL PRIMARY KEY,
            value {long_text} NOT NULL
        )"#;

    pub const SEMAPHORE: &str = r#"
        CREATE TABLE IF NOT EXISTS {semaphore} (
            name VARCHAR(255) NOT NULL PRIMARY KEY,
            value VARCHAR(255) NOT NULL,
            expire DOUBLE PRECISION NOT NULL
        )"#;

    pub const SESSIONS: &str = r#"
        CREATE TABLE IF NOT EXISTS {sessions} (
            sid VARCHAR(128) NOT NULL PRIMARY KEY,
            uid BIGINT NOT NULL DEFAULT 0,
            hostname VARCHAR(128) NOT NULL DEFAULT '',
            timestamp BIGINT NOT NULL DEFAULT 0,
            session {long_text}
        )"#;

    pub const BLOCKED_IPS: &str = r#"
        CREATE TABLE IF NOT EXISTS {blocked_ips} (
            ip VARCHAR(40) NOT NULL PRIMARY KEY
        )"#;

    pub const CACHE_BIN: &str = r#"
        CREATE TABLE IF NOT EXISTS {bin} (
            cid VARCHAR(255) NOT NULL PRIMARY KEY,
            data {long_text},
            expire BIGINT NOT NULL DEFAULT 0,
            created BIGINT NOT NULL DEFAULT 0
        )"#;
}

fn long_text(driver: Driver) -> &'static str {
    match driver {
        Driver::MySql => "LONGTEXT",
        Driver::Pgsql | Driver::Sqlite => "TEXT",
    }
}

/// DDL for every system table, with `{table}` placeholders left for prefixing.
pub fn statements(driver: Driver) -> Vec<String> {
    let text = long_text(driver);
    let mut statements: Vec<String> = [
        queries::VARIABLE,
        queries::SEMAPHORE,
        queries::SESSIONS,
        queries::BLOCKED_IPS,
    ]
    .iter()
    .map(|sql| sql.replace("{long_text}", text))
    .collect();

    statements.extend(CACHE_BINS.iter().map(|bin| {
        queries::CACHE_BIN
            .replace("{long_text}", text)
            .replace("{bin}", &format!("{{{bin}}}"))
    }));
    statements
}

/// Create the system tables on a connection.
pub async fn install(connection: &Connection) -> KernelResult<()> {
    for sql in statements(connection.driver()) {
        connection.execute(&sql, &[]).await?;
    }
    info!(
        key = %connection.key(),
        target = %connection.target(),
        bins = CACHE_BINS.len(),
        "System tables installed"
    );
    Ok(())
}
