//! Integration tests for persistent variables and semaphore locks.
//!
//! Two kernels share one SQLite file to play two concurrent requests.

use serde_json::json;
use site_kernel::bootstrap::Phase;
use site_kernel::config::Settings;
use site_kernel::db::{Database, schema};
use site_kernel::kernel::{Kernel, KernelOptions};
use site_kernel::request::Request;
use tempfile::TempDir;

fn settings(dir: &TempDir, conf: serde_json::Value) -> Settings {
    let path = dir.path().join("vars.db");
    serde_json::from_value(json!({
        "databases": {"default": {"default": {"driver": "sqlite", "database": path.to_str().unwrap()}}},
        "conf": conf,
    }))
    .unwrap()
}

async fn install(settings: &Settings) {
    let mut db = Database::new(settings.databases.clone());
    let conn = db.get_connection("default", None).await.unwrap();
    schema::install(&conn).await.unwrap();
    db.close_all().await;
}

async fn booted(settings: &Settings) -> Kernel {
    let options = KernelOptions::new(".").with_settings(settings.clone());
    let mut kernel = Kernel::new(options, Request::get("/"));
    kernel.bootstrap(Phase::Variables).await.unwrap();
    kernel
}

#[tokio::test]
async fn test_variable_set_is_seen_by_next_request() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut first = booted(&settings).await;
    assert!(first.variable_get("site_name").is_none());
    first.variable_set("site_name", json!("Example")).await.unwrap();
    first.variable_set("anonymous", json!("Guest")).await.unwrap();
    assert_eq!(first.variable_get("site_name"), Some(&json!("Example")));
    first.shutdown().await.unwrap();

    let mut second = booted(&settings).await;
    assert_eq!(second.variables().get_str("site_name"), Some("Example"));
    second.variable_del("anonymous").await.unwrap();
    second.shutdown().await.unwrap();

    let third = booted(&settings).await;
    assert!(third.variable_get("anonymous").is_none());
    assert_eq!(third.variable_get("site_name"), Some(&json!("Example")));
}

#[tokio::test]
async fn test_settings_overrides_win_over_stored_values() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({"site_name": "Forced"}));
    install(&settings).await;

    let mut first = booted(&settings).await;
    first.variable_set("site_name", json!("Stored")).await.unwrap();
    first.shutdown().await.unwrap();

    let second = booted(&settings).await;
    assert_eq!(second.variables().get_str("site_name"), Some("Forced"));
}

#[tokio::test]
async fn test_variables_are_cached_in_bootstrap_bin() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut kernel = booted(&settings).await;
    let cache = kernel.cache("cache_bootstrap").await.unwrap();
    assert!(cache.get("variables").await.unwrap().is_some());

    kernel.variable_set("x", json!(1)).await.unwrap();
    assert!(cache.get("variables").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_is_exclusive_across_requests() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut a = booted(&settings).await;
    let mut b = booted(&settings).await;

    assert!(a.lock_acquire("cron", 30.0).await.unwrap());
    assert!(!b.lock_acquire("cron", 30.0).await.unwrap());
    // Re-acquiring extends the lock.
    assert!(a.lock_acquire("cron", 30.0).await.unwrap());

    a.lock_release("cron").await.unwrap();
    assert!(!b.lock_wait("cron", 0.1).await.unwrap());
    assert!(b.lock_acquire("cron", 30.0).await.unwrap());
}

#[tokio::test]
async fn test_lock_wait_times_out_while_held() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut a = booted(&settings).await;
    let mut b = booted(&settings).await;
    assert!(a.lock_acquire("rebuild", 30.0).await.unwrap());
    assert!(b.lock_wait("rebuild", 0.1).await.unwrap());
}

#[tokio::test]
async fn test_shutdown_releases_locks() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut a = booted(&settings).await;
    assert!(a.lock_acquire("menu_rebuild", 30.0).await.unwrap());
    a.shutdown().await.unwrap();

    let mut b = booted(&settings).await;
    assert!(b.lock_acquire("menu_rebuild", 30.0).await.unwrap());
    b.lock_release_all().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_connections_when_release_fails() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, json!({}));
    install(&settings).await;

    let mut kernel = booted(&settings).await;
    assert!(kernel.lock_acquire("cron", 30.0).await.unwrap());
    let conn = kernel
        .database_mut()
        .get_connection("default", None)
        .await
        .unwrap();
    conn.execute("DROP TABLE {semaphore}", &[]).await.unwrap();

    assert!(kernel.shutdown().await.is_err());
    assert!(conn.is_destroyed());
    assert!(kernel.database_mut().open_targets("default").is_empty());
}
