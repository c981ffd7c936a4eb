use std::marker::PhantomData;

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::error;

use crate::db::{Db, Transactional, TxHandle};
use crate::error::PIVOTAL_INVALID_COLUMN;
use crate::model::{GroupPivotal, HousePivotal, Pivotal, PivotalSource};
use crate::time::{from_micros_opt, to_micros};
use crate::{AppError, AppResult};

const PIVOTAL_COLUMNS: &str =
    "id, income, payments, total, latest_income_update_date, latest_payment_update_date";

/// A keyed pivotal variant with its own table.
pub trait StoredPivotal: PivotalSource + Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    const SOURCE_COLUMN: &'static str;
    /// `house` or `group`; used in logs and errors.
    const KIND: &'static str;

    fn from_parts(pivotal: Pivotal, source_id: String) -> Self;
}

impl StoredPivotal for HousePivotal {
    const TABLE: &'static str = "house_pivotals";
    const SOURCE_COLUMN: &'static str = "house_id";
    const KIND: &'static str = "house";

    fn from_parts(pivotal: Pivotal, house_id: String) -> Self {
        Self { pivotal, house_id }
    }
}

impl StoredPivotal for GroupPivotal {
    const TABLE: &'static str = "group_pivotals";
    const SOURCE_COLUMN: &'static str = "group_id";
    const KIND: &'static str = "group";

    fn from_parts(pivotal: Pivotal, group_id: String) -> Self {
        Self { pivotal, group_id }
    }
}

/// Columns `delete_by` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotalColumn {
    Id,
    /// `house_id` or `group_id`, depending on the variant.
    Source,
}

impl PivotalColumn {
    /// Accepts `id` or the variant's source column name.
    pub fn parse<S: StoredPivotal>(name: &str) -> AppResult<Self> {
        if name == "id" {
            Ok(PivotalColumn::Id)
        } else if name == S::SOURCE_COLUMN {
            Ok(PivotalColumn::Source)
        } else {
            Err(AppError::new(PIVOTAL_INVALID_COLUMN, "invalid column")
                .with_context("table", S::TABLE)
                .with_context("column", name))
        }
    }

    fn name<S: StoredPivotal>(self) -> &'static str {
        match self {
            PivotalColumn::Id => "id",
            PivotalColumn::Source => S::SOURCE_COLUMN,
        }
    }
}

/// Owns the pivotal rows of one variant. Only the pivotal row and its key
/// column are written; houses, groups and their records are never touched.
pub struct PivotalRepository<S> {
    db: Db,
    _variant: PhantomData<fn() -> S>,
}

pub type HousePivotalRepository = PivotalRepository<HousePivotal>;
pub type GroupPivotalRepository = PivotalRepository<GroupPivotal>;

impl<S> Clone for PivotalRepository<S> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            _variant: PhantomData,
        }
    }
}

impl<S> Transactional for PivotalRepository<S> {
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            _variant: PhantomData,
        }
    }
}

impl<S: StoredPivotal> PivotalRepository<S> {
    pub fn new(pool: SqlitePool) -> Self {
        Self::on(Db::Pool(pool))
    }

    pub fn on(db: Db) -> Self {
        Self {
            db,
            _variant: PhantomData,
        }
    }

    pub async fn create(&self, entity: &S) -> AppResult<()> {
        self.create_batch(std::slice::from_ref(entity)).await
    }

    /// One multi-row INSERT. An empty batch is a no-op.
    pub async fn create_batch(&self, entities: &[S]) -> AppResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, {}) ",
            S::TABLE,
            PIVOTAL_COLUMNS,
            S::SOURCE_COLUMN
        ));
        builder.push_values(entities, |mut row, entity| {
            let p = entity.pivotal();
            row.push_bind(p.id.clone())
                .push_bind(p.income)
                .push_bind(p.payments)
                .push_bind(p.total)
                .push_bind(p.latest_income_update_date.map(to_micros))
                .push_bind(p.latest_payment_update_date.map(to_micros))
                .push_bind(entity.source_id().to_string());
        });
        let mut conn = self.db.acquire().await?;
        builder.build().execute(&mut *conn).await?;
        Ok(())
    }

    /// Overwrites the figures of `entity` only if the stored row still carries
    /// `prior`'s watermarks. Returns whether a row was written.
    pub async fn replace(&self, prior: &Pivotal, entity: &S) -> AppResult<bool> {
        let p = entity.pivotal();
        let sql = format!(
            "UPDATE {} SET income = ?, payments = ?, total = ?, \
             latest_income_update_date = ?, latest_payment_update_date = ? \
             WHERE id = ? AND latest_income_update_date IS ? AND latest_payment_update_date IS ?",
            S::TABLE
        );
        let mut conn = self.db.acquire().await?;
        let res = sqlx::query(&sql)
            .bind(p.income)
            .bind(p.payments)
            .bind(p.total)
            .bind(p.latest_income_update_date.map(to_micros))
            .bind(p.latest_payment_update_date.map(to_micros))
            .bind(&prior.id)
            .bind(prior.latest_income_update_date.map(to_micros))
            .bind(prior.latest_payment_update_date.map(to_micros))
            .execute(&mut *conn)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Bulk delete; zero matches is not an error.
    pub async fn delete_by(&self, column: PivotalColumn, value: &str) -> AppResult<u64> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", S::TABLE, column.name::<S>());
        let mut conn = self.db.acquire().await?;
        let res = sqlx::query(&sql).bind(value).execute(&mut *conn).await?;
        Ok(res.rows_affected())
    }

    pub async fn delete_by_source_id(&self, source_id: &str) -> AppResult<u64> {
        self.delete_by(PivotalColumn::Source, source_id).await
    }

    /// `None` when no row exists. Two rows for one source is an invariant
    /// violation and is surfaced, never repaired.
    pub async fn find_by_source_id(&self, source_id: &str) -> AppResult<Option<S>> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} = ? LIMIT 2",
            PIVOTAL_COLUMNS,
            S::SOURCE_COLUMN,
            S::TABLE,
            S::SOURCE_COLUMN
        );
        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query(&sql).bind(source_id).fetch_all(&mut *conn).await?;
        match rows.as_slice() {
            [] => Ok(None),
            [row] => deserialize::<S>(row).map(Some),
            _ => {
                error!(
                    target: "homebills",
                    event = "pivotal_duplicate_rows",
                    kind = S::KIND,
                    source_id = %source_id
                );
                Err(AppError::invariant(format!(
                    "more than one {} pivotal stored for {source_id}",
                    S::KIND
                ))
                .with_context("source_id", source_id)
                .with_context("table", S::TABLE))
            }
        }
    }

    pub async fn exists(&self, pivotal_id: &str) -> AppResult<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", S::TABLE);
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(&sql).bind(pivotal_id).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }
}

fn deserialize<S: StoredPivotal>(row: &SqliteRow) -> AppResult<S> {
    let pivotal = Pivotal {
        id: row.try_get("id")?,
        income: row.try_get("income")?,
        payments: row.try_get("payments")?,
        total: row.try_get("total")?,
        latest_income_update_date: from_micros_opt(row.try_get("latest_income_update_date")?)?,
        latest_payment_update_date: from_micros_opt(row.try_get("latest_payment_update_date")?)?,
    };
    let source_id: String = row.try_get(S::SOURCE_COLUMN)?;
    Ok(S::from_parts(pivotal, source_id))
}

