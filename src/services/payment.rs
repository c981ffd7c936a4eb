use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{notify, placeholders, validate_amount, validate_date, window_binds, Mutation, PaymentService, SharedListener};
use crate::db::{Db, Transactional, TxHandle};
use crate::error::PAYMENT_NOT_FOUND;
use crate::id::new_uuid_v7;
use crate::model::{AmountUpdate, Delta, NewPayment, PaymentDto};
use crate::time::{from_micros, from_micros_opt, now_ms, to_micros};
use crate::{AppError, AppResult};

const SELECT_COLUMNS: &str = "SELECT id, house_id, name, description, sum, date FROM payments";
const WINDOW: &str = "(? IS NULL OR date > ?) AND (? IS NULL OR date <= ?)";
const ORDER_PAGE: &str = "ORDER BY date DESC, id DESC LIMIT ? OFFSET ?";

#[derive(Clone)]
pub struct SqlitePaymentService {
    db: Db,
    listener: Option<SharedListener>,
}

impl SqlitePaymentService {
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

    pub async fn create(&self, new: NewPayment) -> AppResult<PaymentDto> {
        validate_amount(new.sum)?;
        validate_date(new.date)?;
        let listener = self.listener.clone();
        self.db
            .write_scope(|db| async move {
                let payment = PaymentDto {
                    id: new_uuid_v7(),
                    house_id: new.house_id,
                    name: new.name,
                    description: new.description,
                    sum: new.sum,
                    date: new.date,
                };
                {
                    let mut conn = db.acquire().await?;
                    let house = sqlx::query("SELECT 1 FROM houses WHERE id = ?")
                        .bind(&payment.house_id)
                        .fetch_optional(&mut *conn)
                        .await?;
                    if house.is_none() {
                        return Err(AppError::house_not_found(&payment.house_id));
                    }
                    let now = now_ms();
                    sqlx::query(
                        "INSERT INTO payments (id, house_id, name, description, sum, date, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&payment.id)
                    .bind(&payment.house_id)
                    .bind(&payment.name)
                    .bind(&payment.description)
                    .bind(payment.sum)
                    .bind(to_micros(payment.date))
                    .bind(now)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                }
                info!(
                    target: "homebills",
                    event = "payment_created",
                    payment_id = %payment.id,
                    house_id = %payment.house_id
                );
                notify(
                    &listener,
                    &db,
                    Mutation::PaymentCreated {
                        house_id: payment.house_id.clone(),
                        date: payment.date,
                    },
                )
                .await?;
                Ok(payment)
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> AppResult<PaymentDto> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| payment_not_found(id))?;
        deserialize_payment(&row)
    }

    pub async fn update(&self, id: &str, update: AmountUpdate) -> AppResult<PaymentDto> {
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
                let updated = PaymentDto {
                    name: update.name.unwrap_or(current.name),
                    sum: update.sum.unwrap_or(current.sum),
                    date: update.date.unwrap_or(current.date),
                    ..current
                };
                {
                    let mut conn = db.acquire().await?;
                    sqlx::query(
                        "UPDATE payments SET name = ?, sum = ?, date = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(&updated.name)
                    .bind(updated.sum)
                    .bind(to_micros(updated.date))
                    .bind(now_ms())
                    .bind(&updated.id)
                    .execute(&mut *conn)
                    .await?;
                }
                info!(target: "homebills", event = "payment_updated", payment_id = %updated.id);
                notify(
                    &listener,
                    &db,
                    Mutation::PaymentChanged {
                        house_id: updated.house_id.clone(),
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
                    sqlx::query("DELETE FROM payments WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?;
                }
                info!(target: "homebills", event = "payment_deleted", payment_id = %id);
                notify(
                    &listener,
                    &db,
                    Mutation::PaymentChanged {
                        house_id: current.house_id,
                    },
                )
                .await
            })
            .await
    }
}

impl Transactional for SqlitePaymentService {
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            listener: self.listener.clone(),
        }
    }
}

#[async_trait]
impl PaymentService for SqlitePaymentService {
    async fn find_by_house_id(
        &self,
        house_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<PaymentDto>> {
        let sql = format!("{SELECT_COLUMNS} WHERE house_id = ? AND {WINDOW} {ORDER_PAGE}");
        let mut query = sqlx::query(&sql).bind(house_id);
        for bound in window_binds(from, to) {
            query = query.bind(bound);
        }
        let mut conn = self.db.acquire().await?;
        let rows = query.bind(limit).bind(offset).fetch_all(&mut *conn).await?;
        rows.iter().map(deserialize_payment).collect()
    }

    async fn find_by_group_id(
        &self,
        group_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<PaymentDto>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE house_id IN (SELECT house_id FROM house_groups WHERE group_id = ?) \
             AND {WINDOW} {ORDER_PAGE}"
        );
        let mut query = sqlx::query(&sql).bind(group_id);
        for bound in window_binds(from, to) {
            query = query.bind(bound);
        }
        let mut conn = self.db.acquire().await?;
        let rows = query.bind(limit).bind(offset).fetch_all(&mut *conn).await?;
        rows.iter().map(deserialize_payment).collect()
    }

    async fn calculate_delta(
        &self,
        house_ids: &[String],
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta> {
        if house_ids.is_empty() {
            return Ok(Delta::default());
        }
        let sql = format!(
            "SELECT COALESCE(SUM(sum), 0.0) AS total, MAX(date) AS latest FROM payments \
             WHERE house_id IN ({}) AND (? IS NULL OR date > ?)",
            placeholders(house_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in house_ids {
            query = query.bind(id);
        }
        let from = from.map(to_micros);
        let mut conn = self.db.acquire().await?;
        let row = query.bind(from).bind(from).fetch_one(&mut *conn).await?;
        Ok(Delta {
            sum: row.try_get("total")?,
            latest: from_micros_opt(row.try_get("latest")?)?,
        })
    }
}

fn payment_not_found(id: &str) -> AppError {
    AppError::new(PAYMENT_NOT_FOUND, format!("Payment {id} not found")).with_context("id", id)
}

fn deserialize_payment(row: &SqliteRow) -> AppResult<PaymentDto> {
    Ok(PaymentDto {
        id: row.try_get("id")?,
        house_id: row.try_get("house_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        sum: row.try_get("sum")?,
        date: from_micros(row.try_get("date")?)?,
    })
}
