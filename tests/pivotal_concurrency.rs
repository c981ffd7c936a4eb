use std::time::Duration;

use anyhow::Result;

use homebills_lib::config::AppConfig;
use homebills_lib::migrate::apply_migrations;
use homebills_lib::pivotal::GroupPivotalRepository;
use homebills_lib::{open_sqlite_pool, AppState};

#[path = "util.rs"]
mod util;

use util::day;

async fn file_backed(dir: &tempfile::TempDir) -> Result<AppState> {
    let pool = open_sqlite_pool(&dir.path().join("homebills.sqlite3")).await?;
    apply_migrations(&pool).await?;
    let config = AppConfig {
        recompute_retries: 10,
        retry_backoff: Duration::from_millis(5),
        ..AppConfig::default()
    };
    Ok(AppState::new(pool, config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_recomputes_leave_one_group_row() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = file_backed(&dir).await?;

    let g = util::group(&state, "G").await;
    let h1 = util::house_in_groups(&state, "H1", &[g.as_str()]).await;
    let h2 = util::house_in_groups(&state, "H2", &[g.as_str()]).await;
    util::pay(&state, &h1, 100.0, day(2021, 1, 1)).await;
    util::pay(&state, &h2, 200.0, day(2021, 1, 3)).await;
    util::group_income(&state, &[g.as_str()], 300.0, day(2021, 1, 2)).await;
    util::group_income(&state, &[g.as_str()], 400.0, day(2021, 1, 4)).await;

    let mut tasks = Vec::new();
    for house_id in [&h1, &h2, &h1, &h2] {
        let calculator = state.calculator.clone();
        let house_id = house_id.clone();
        tasks.push(tokio::spawn(async move {
            calculator.calculate(&house_id).await
        }));
    }
    for task in tasks {
        let response = task.await??;
        assert_eq!(response.total.income, 700.0);
        assert_eq!(response.total.payments, 300.0);
    }

    assert_eq!(util::count(&state.pool, "group_pivotals").await, 1);
    assert_eq!(util::count(&state.pool, "house_pivotals").await, 2);
    let group = GroupPivotalRepository::new(state.pool.clone())
        .find_by_source_id(&g)
        .await?
        .expect("group row");
    assert_eq!(group.pivotal.income, 700.0);
    assert_eq!(group.pivotal.payments, 300.0);
    assert_eq!(group.pivotal.total, 400.0);

    state.pool.close().await;
    Ok(())
}
