#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use homebills_lib::config::AppConfig;
use homebills_lib::migrate::apply_migrations;
use homebills_lib::model::{IncomeDto, IncomeScope, NewIncome, NewPayment, PaymentDto};
use homebills_lib::AppState;

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

pub async fn migrated_pool() -> SqlitePool {
    let pool = temp_pool().await;
    apply_migrations(&pool).await.expect("apply migrations");
    pool
}

pub async fn app() -> AppState {
    AppState::new(migrated_pool().await, AppConfig::default())
}

/// Midnight UTC.
pub fn day(year: i32, month: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, d, 0, 0, 0).unwrap()
}

pub async fn house_in_groups(state: &AppState, name: &str, group_ids: &[&str]) -> String {
    let house = state.houses.create(name).await.expect("create house");
    for group_id in group_ids {
        state
            .houses
            .add_to_group(&house.id, group_id)
            .await
            .expect("join group");
    }
    house.id
}

pub async fn group(state: &AppState, name: &str) -> String {
    state.groups.create(name).await.expect("create group").id
}

pub async fn pay(state: &AppState, house_id: &str, sum: f64, date: DateTime<Utc>) -> PaymentDto {
    state
        .payments
        .create(NewPayment {
            house_id: house_id.to_string(),
            name: "bill".into(),
            description: None,
            sum,
            date,
        })
        .await
        .expect("create payment")
}

pub async fn house_income(
    state: &AppState,
    house_id: &str,
    sum: f64,
    date: DateTime<Utc>,
) -> IncomeDto {
    income(state, IncomeScope::House(house_id.to_string()), sum, date).await
}

pub async fn group_income(
    state: &AppState,
    group_ids: &[&str],
    sum: f64,
    date: DateTime<Utc>,
) -> IncomeDto {
    let ids = group_ids.iter().map(|id| id.to_string()).collect();
    income(state, IncomeScope::Groups(ids), sum, date).await
}

async fn income(state: &AppState, scope: IncomeScope, sum: f64, date: DateTime<Utc>) -> IncomeDto {
    state
        .incomes
        .create(NewIncome {
            scope,
            name: "salary".into(),
            description: None,
            sum,
            date,
        })
        .await
        .expect("create income")
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows")
}
