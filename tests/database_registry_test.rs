//! Integration tests for the connection registry.
//!
//! Tests verify that:
//! - A `(key, target)` pair maps to one shared connection
//! - Unconfigured and ignored targets fall back to `default`
//! - Renaming and removing keys move or drop their connections
//! - Table prefixes, transactions and query logs work against SQLite files

use serde_json::json;
use site_kernel::config::Settings;
use site_kernel::db::{ConnectionOptions, Database, QueryParam};
use site_kernel::error::KernelError;
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

fn registry(dir: &TempDir) -> Database {
    let settings: Settings = serde_json::from_value(json!({
        "databases": {
            "default": {
                "default": {"driver": "sqlite", "database": sqlite(dir, "main.db"), "prefix": "main_"},
                "slave": [
                    {"driver": "sqlite", "database": sqlite(dir, "replica.db")},
                    {"driver": "sqlite", "database": sqlite(dir, "replica.db")}
                ]
            },
            "legacy": {
                "default": {"driver": "sqlite", "database": sqlite(dir, "legacy.db")}
            }
        }
    }))
    .unwrap();
    Database::new(settings.databases)
}

#[tokio::test]
async fn test_connection_is_shared_per_key_and_target() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    let a = db.get_connection("default", None).await.unwrap();
    let b = db.get_connection("default", Some("default")).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let slave = db.get_connection("slave", None).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &slave));
    assert_eq!(slave.target(), "slave");
    assert_eq!(db.open_targets("default"), vec!["default", "slave"]);
    db.close_all().await;
}

#[tokio::test]
async fn test_missing_target_falls_back_to_default() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    let legacy_default = db.get_connection("default", Some("legacy")).await.unwrap();
    let legacy_slave = db.get_connection("slave", Some("legacy")).await.unwrap();
    assert!(Arc::ptr_eq(&legacy_default, &legacy_slave));
    assert_eq!(legacy_slave.target(), "default");
}

#[tokio::test]
async fn test_ignored_target_routes_to_default() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    db.ignore_target("default", "slave");
    let conn = db.get_connection("slave", None).await.unwrap();
    assert_eq!(conn.target(), "default");
    assert_eq!(db.open_targets("default"), vec!["default"]);
}

#[tokio::test]
async fn test_missing_key_is_not_defined() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);
    let err = db.get_connection("default", Some("nope")).await.unwrap_err();
    assert!(matches!(err, KernelError::ConnectionNotDefined { ref key } if key == "nope"));
}

#[tokio::test]
async fn test_rename_moves_open_connections() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    let conn = db.get_connection("default", Some("legacy")).await.unwrap();
    assert!(db.rename_connection("legacy", "archive"));
    assert!(!db.rename_connection("legacy", "other"));
    assert!(!db.rename_connection("archive", "default"));

    let renamed = db.get_connection("default", Some("archive")).await.unwrap();
    assert!(Arc::ptr_eq(&conn, &renamed));
    assert_eq!(renamed.key(), "archive");
    assert!(db.connection_info("legacy").is_none());
}

#[tokio::test]
async fn test_remove_connection_closes_it() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    let conn = db.get_connection("default", Some("legacy")).await.unwrap();
    assert!(db.remove_connection("legacy").await);
    assert!(conn.is_destroyed());
    assert!(!db.remove_connection("legacy").await);
    assert!(db.get_connection("default", Some("legacy")).await.is_err());
}

#[tokio::test]
async fn test_runtime_connection_info() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    db.add_connection_info(
        "extra",
        "default",
        ConnectionOptions::new("sqlite", sqlite(&dir, "extra.db")).with_prefix("x_"),
    );
    let previous = db.set_active_connection("extra");
    assert_eq!(previous.as_deref(), Some("default"));
    assert_eq!(db.active_key(), "extra");

    let conn = db.get_connection("default", None).await.unwrap();
    assert_eq!(conn.key(), "extra");
    assert_eq!(conn.prefix_tables("SELECT * FROM {node}"), "SELECT * FROM x_node");
}

#[tokio::test]
async fn test_prefixed_queries_and_transactions() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);
    let conn = db.get_connection("default", None).await.unwrap();

    conn.execute(
        "CREATE TABLE {node} (nid INTEGER PRIMARY KEY, title TEXT NOT NULL)",
        &[],
    )
    .await
    .unwrap();
    conn.execute(
        "INSERT INTO {node} (nid, title) VALUES (?, ?)",
        &[1i64.into(), "First".into()],
    )
    .await
    .unwrap();

    let mut tx = conn.transaction().await.unwrap();
    tx.execute(
        "INSERT INTO {node} (nid, title) VALUES (?, ?)",
        &[2i64.into(), "Rolled back".into()],
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    let rows = conn
        .query("SELECT nid, title FROM main_node ORDER BY nid", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["title"], json!("First"));

    let count = conn
        .query_value("SELECT COUNT(*) FROM {node}", &[])
        .await
        .unwrap();
    assert_eq!(count, Some(json!(1)));
}

#[tokio::test]
async fn test_query_log_collects_per_key() {
    let dir = TempDir::new().unwrap();
    let mut db = registry(&dir);

    db.start_log("request", "default");
    let conn = db.get_connection("default", None).await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    conn.query("SELECT 1 WHERE 1 = ?", &[QueryParam::Int(2)]).await.unwrap();

    let legacy = db.get_connection("default", Some("legacy")).await.unwrap();
    legacy.query("SELECT 3", &[]).await.unwrap();

    let records = db.get_log("request", "default");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].args, vec![QueryParam::Int(2)]);
    assert_eq!(records[0].target, "default");
    assert!(db.get_log("request", "default").is_empty());
}
