use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

use homebills_lib::config::AppConfig;
use homebills_lib::migrate::apply_migrations;
use homebills_lib::{open_sqlite_pool, AppState};

#[path = "util.rs"]
mod util;

use util::day;

fn homebills(db: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("homebills")?;
    cmd.env("HOMEBILLS_LOG", "warn")
        .env_remove("HOMEBILLS_LOG_DIR")
        .arg("--db")
        .arg(db);
    Ok(cmd)
}

/// One ungrouped house with a payment and an income; returns its id.
async fn seed(db: &Path) -> Result<String> {
    let pool = open_sqlite_pool(db).await?;
    apply_migrations(&pool).await?;
    let state = AppState::new(pool.clone(), AppConfig::default());
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    util::pay(&state, &house_id, 100.0, day(2021, 1, 1)).await;
    util::house_income(&state, &house_id, 250.0, day(2021, 1, 2)).await;
    pool.close().await;
    Ok(house_id)
}

#[test]
fn migrate_reports_status() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("homebills.sqlite3");

    let output = homebills(&db)?.arg("migrate").output()?;
    assert!(
        output.status.success(),
        "migrate failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let body: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(body["status"], "ok");
    assert!(body["versions"].as_array().is_some_and(|v| !v.is_empty()));
    assert!(db.exists());
    Ok(())
}

#[tokio::test]
async fn calculate_prints_the_response() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("homebills.sqlite3");
    let house_id = seed(&db).await?;

    let output = homebills(&db)?
        .args(["pivotal", "calculate", house_id.as_str()])
        .output()?;
    assert!(
        output.status.success(),
        "calculate failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let body: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(body["house"]["house_id"], house_id.as_str());
    assert_eq!(body["house"]["total"], 150.0);
    assert_eq!(body["groups"], Value::Array(Vec::new()));
    assert_eq!(body["total"]["income"], 250.0);

    let output = homebills(&db)?
        .args(["pivotal", "house", house_id.as_str()])
        .output()?;
    assert!(output.status.success());
    let body: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(body["payments"], 100.0);
    Ok(())
}

#[test]
fn unknown_house_exits_with_not_found() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("homebills.sqlite3");

    let output = homebills(&db)?
        .args(["pivotal", "house", "missing"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("HOUSE/NOT_FOUND"), "stderr={stderr}");

    let output = homebills(&db)?
        .args(["pivotal", "group", "missing"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}
