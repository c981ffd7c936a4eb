use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use super::{notify, placeholders, validate_amount, validate_date, window_binds, IncomeService, Mutation, SharedListener};
use crate::db::{Db, Transactional, TxHandle};
use crate::error::{INCOME_NOT_FOUND, VALIDATION_SCOPE};
use crate::id::new_uuid_v7;
use crate::model::{AmountUpdate, Delta, IncomeDto, IncomeScope, NewIncome};
use crate::time::{from_micros, from_micros_opt, now_ms, to_micros};
use crate::{AppError, AppResult};

const SELECT_COLUMNS: &str = "SELECT i.id, i.house_id, i.name, i.description, i.sum, i.date, \
     (SELECT GROUP_CONCAT(ig.group_id, ',') FROM income_groups ig WHERE ig.income_id = i.id) AS group_ids \
     FROM incomes i";
const WINDOW: &str = "(? IS NULL OR i.date > ?) AND (? IS NULL OR i.date <= ?)";
const ORDER_PAGE: &str = "ORDER BY i.date DESC, i.id DESC LIMIT ? OFFSET ?";

#[derive(Clone)]
pub struct SqliteIncomeService {
    db: Db,
    listener: Option<SharedListener>,
}

impl SqliteIncomeService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            db: Db::Pool(pool),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub async fn create(&self, new: NewIncome) -> AppResult<IncomeDto> {
        validate_amount(new.sum)?;
        validate_date(new.date)?;
        let scope = normalize_scope(new.scope)?;
        let listener = self.listener.clone();
        self.db
            .write_scope(|db| async move {
                let (house_id, group_ids) = match &scope {
                    IncomeScope::House(id) => (Some(id.clone()), Vec::new()),
                    IncomeScope::Groups(ids) => (None, ids.clone()),
                };
                let income = IncomeDto {
                    id: new_uuid_v7(),
                    house_id,
                    group_ids,
                    name: new.name,
                    description: new.description,
                    sum: new.sum,
                    date: new.date,
                };
                {
                    let mut conn = db.acquire().await?;
                    ensure_scope_exists(&mut conn, &scope).await?;
                    let now = now_ms();
                    sqlx::query(
                        "INSERT INTO incomes (id, house_id, name, description, sum, date, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&income.id)
                    .bind(&income.house_id)
                    .bind(&income.name)
                    .bind(&income.description)
                    .bind(income.sum)
                    .bind(to_micros(income.date))
                    .bind(now)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                    for group_id in &income.group_ids {
                        sqlx::query("INSERT INTO income_groups (income_id, group_id) VALUES (?, ?)")
                            .bind(&income.id)
                            .bind(group_id)
                            .execute(&mut *conn)
                            .await?;
                    }
                }
                info!(
                    target: "homebills",
                    event = "income_created",
                    income_id = %income.id,
                    groups = income.group_ids.len()
                );
                notify(
                    &listener,
                    &db,
                    Mutation::IncomeCreated {
                        scope,
                        date: income.date,
                    },
                )
                .await?;
                Ok(income)
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> AppResult<IncomeDto> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE i.id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                AppError::new(INCOME_NOT_FOUND, format!("Income {id} not found")).with_context("id", id)
            })?;
        deserialize_income(&row)
    }

    pub async fn update(&self, id: &str, update: AmountUpdate) -> AppResult<IncomeDto> {
        if let Some(sum) = update.sum {
            validate_amount(sum)?;
        }
        if let Some(date) = update.date {
            validate_date(date)?;
        }
        let id = id.to_string();
        let listener = self.listener.clone();
        let service = self.clone();
        self.db
            .write_scope(|db| async move {
                let current = db.bind(&service).find_by_id(&id).await?;
                let updated = IncomeDto {
                    name: update.name.unwrap_or(current.name),
                    sum: update.sum.unwrap_or(current.sum),
                    date: update.date.unwrap_or(current.date),
                    ..current
                };
                {
                    let mut conn = db.acquire().await?;
                    sqlx::query(
                        "UPDATE incomes SET name = ?, sum = ?, date = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(&updated.name)
                    .bind(updated.sum)
                    .bind(to_micros(updated.date))
                    .bind(now_ms())
                    .bind(&updated.id)
                    .execute(&mut *conn)
                    .await?;
                }
                info!(target: "homebills", event = "income_updated", income_id = %updated.id);
                notify(
                    &listener,
                    &db,
                    Mutation::IncomeChanged {
                        scope: scope_of(&updated),
                    },
                )
                .await?;
                Ok(updated)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        let listener = self.listener.clone();
        let service = self.clone();
        self.db
            .write_scope(|db| async move {
                let current = db.bind(&service).find_by_id(&id).await?;
                {
                    let mut conn = db.acquire().await?;
                    sqlx::query("DELETE FROM incomes WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?;
                }
                info!(target: "homebills", event = "income_deleted", income_id = %id);
                notify(
                    &listener,
                    &db,
                    Mutation::IncomeChanged {
                        scope: scope_of(&current),
                    },
                )
                .await
            })
            .await
    }
}

impl Transactional for SqliteIncomeService {
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            listener: self.listener.clone(),
        }
    }
}

#[async_trait]
impl IncomeService for SqliteIncomeService {
    async fn find_by_house_id(
        &self,
        house_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<IncomeDto>> {
        let sql = format!("{SELECT_COLUMNS} WHERE i.house_id = ? AND {WINDOW} {ORDER_PAGE}");
        let mut query = sqlx::query(&sql).bind(house_id);
        for bound in window_binds(from, to) {
            query = query.bind(bound);
        }
        let mut conn = self.db.acquire().await?;
        let rows = query.bind(limit).bind(offset).fetch_all(&mut *conn).await?;
        rows.iter().map(deserialize_income).collect()
    }

    async fn find_by_group_ids(
        &self,
        group_ids: &[String],
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<IncomeDto>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_COLUMNS} WHERE EXISTS (SELECT 1 FROM income_groups ig \
             WHERE ig.income_id = i.id AND ig.group_id IN ({})) AND {WINDOW} {ORDER_PAGE}",
            placeholders(group_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in group_ids {
            query = query.bind(id);
        }
        for bound in window_binds(from, to) {
            query = query.bind(bound);
        }
        let mut conn = self.db.acquire().await?;
        let rows = query.bind(limit).bind(offset).fetch_all(&mut *conn).await?;
        rows.iter().map(deserialize_income).collect()
    }

    async fn calculate_delta_by_house_id(
        &self,
        house_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta> {
        let from = from.map(to_micros);
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT COALESCE(SUM(sum), 0.0) AS total, MAX(date) AS latest FROM incomes \
             WHERE house_id = ? AND (? IS NULL OR date > ?)",
        )
        .bind(house_id)
        .bind(from)
        .bind(from)
        .fetch_one(&mut *conn)
        .await?;
        deserialize_delta(&row)
    }

    async fn calculate_delta_by_group_id(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta> {
        let from = from.map(to_micros);
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT COALESCE(SUM(i.sum), 0.0) AS total, MAX(i.date) AS latest FROM incomes i \
             JOIN income_groups ig ON ig.income_id = i.id \
             WHERE ig.group_id = ? AND (? IS NULL OR i.date > ?)",
        )
        .bind(group_id)
        .bind(from)
        .bind(from)
        .fetch_one(&mut *conn)
        .await?;
        deserialize_delta(&row)
    }
}

/// Group scopes are deduplicated and must name at least one group.
fn normalize_scope(scope: IncomeScope) -> AppResult<IncomeScope> {
    match scope {
        IncomeScope::House(id) => Ok(IncomeScope::House(id)),
        IncomeScope::Groups(mut ids) => {
            ids.sort();
            ids.dedup();
            if ids.is_empty() {
                return Err(AppError::new(
                    VALIDATION_SCOPE,
                    "An income needs a house or at least one group.",
                ));
            }
            Ok(IncomeScope::Groups(ids))
        }
    }
}

async fn ensure_scope_exists(conn: &mut SqliteConnection, scope: &IncomeScope) -> AppResult<()> {
    match scope {
        IncomeScope::House(id) => {
            let row = sqlx::query("SELECT 1 FROM houses WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
            if row.is_none() {
                return Err(AppError::house_not_found(id));
            }
        }
        IncomeScope::Groups(ids) => {
            for id in ids {
                let row = sqlx::query("SELECT 1 FROM groups WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if row.is_none() {
                    return Err(AppError::group_not_found(id));
                }
            }
        }
    }
    Ok(())
}

fn scope_of(income: &IncomeDto) -> IncomeScope {
    match &income.house_id {
        Some(id) => IncomeScope::House(id.clone()),
        None => IncomeScope::Groups(income.group_ids.clone()),
    }
}

fn deserialize_income(row: &SqliteRow) -> AppResult<IncomeDto> {
    let group_ids: Option<String> = row.try_get("group_ids")?;
    let mut group_ids: Vec<String> = group_ids
        .map(|joined| joined.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    group_ids.sort();
    Ok(IncomeDto {
        id: row.try_get("id")?,
        house_id: row.try_get("house_id")?,
        group_ids,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        sum: row.try_get("sum")?,
        date: from_micros(row.try_get("date")?)?,
    })
}

fn deserialize_delta(row: &SqliteRow) -> AppResult<Delta> {
    Ok(Delta {
        sum: row.try_get("total")?,
        latest: from_micros_opt(row.try_get("latest")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_scope_is_deduplicated() {
        let scope = normalize_scope(IncomeScope::Groups(vec!["b".into(), "a".into(), "b".into()]))
            .expect("valid scope");
        assert_eq!(scope, IncomeScope::Groups(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn empty_group_scope_is_rejected() {
        let err = normalize_scope(IncomeScope::Groups(Vec::new())).unwrap_err();
        assert_eq!(err.code(), VALIDATION_SCOPE);
    }
}
