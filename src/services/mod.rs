//! Collaborators the pivotal engine reads from: houses, groups, incomes and
//! payments. The traits are what the engine depends on; the `Sqlite*`
//! types are the shipped implementations and also own the write paths that
//! feed [`MutationListener`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{Db, Transactional};
use crate::model::{Delta, HouseDto, IncomeDto, IncomeScope, PaymentDto};
use crate::time::{is_storable_record_date, to_micros};
use crate::{AppError, AppResult};

mod group;
mod house;
mod income;
mod payment;

pub use group::SqliteGroupService;
pub use house::SqliteHouseService;
pub use income::SqliteIncomeService;
pub use payment::SqlitePaymentService;

/// `limit`/`offset` value meaning "all rows".
pub const ALL: i64 = -1;

#[async_trait]
pub trait HouseService: Transactional + Clone + Send + Sync + 'static {
    async fn find_by_id(&self, id: &str) -> AppResult<HouseDto>;
    async fn exists_by_id(&self, id: &str) -> AppResult<bool>;
    async fn find_houses_by_group_id(&self, group_id: &str) -> AppResult<Vec<HouseDto>>;
}

#[async_trait]
pub trait GroupService: Transactional + Clone + Send + Sync + 'static {
    async fn exists_by_id(&self, id: &str) -> AppResult<bool>;
}

/// Income lookups. Listings are ordered by `date` descending; bounds are
/// `date > from` and `date <= to`.
#[async_trait]
pub trait IncomeService: Transactional + Clone + Send + Sync + 'static {
    async fn find_by_house_id(
        &self,
        house_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<IncomeDto>>;

    async fn find_by_group_ids(
        &self,
        group_ids: &[String],
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<IncomeDto>>;

    async fn calculate_delta_by_house_id(
        &self,
        house_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta>;

    async fn calculate_delta_by_group_id(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta>;

    async fn calculate_sum_by_house_id(
        &self,
        house_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<f64> {
        Ok(self.calculate_delta_by_house_id(house_id, from).await?.sum)
    }

    async fn calculate_sum_by_group_id(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
    ) -> AppResult<f64> {
        Ok(self.calculate_delta_by_group_id(group_id, from).await?.sum)
    }
}

/// Payment lookups. A payment belongs to exactly one house; a group sees the
/// payments of its member houses.
#[async_trait]
pub trait PaymentService: Transactional + Clone + Send + Sync + 'static {
    async fn find_by_house_id(
        &self,
        house_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<PaymentDto>>;

    async fn find_by_group_id(
        &self,
        group_id: &str,
        limit: i64,
        offset: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<PaymentDto>>;

    async fn calculate_delta(
        &self,
        house_ids: &[String],
        from: Option<DateTime<Utc>>,
    ) -> AppResult<Delta>;

    async fn calculate_sum(
        &self,
        house_ids: &[String],
        from: Option<DateTime<Utc>>,
    ) -> AppResult<f64> {
        Ok(self.calculate_delta(house_ids, from).await?.sum)
    }
}

/// A committed-or-about-to-commit write that can change pivotal figures.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PaymentCreated {
        house_id: String,
        date: DateTime<Utc>,
    },
    /// Update or delete of an existing payment.
    PaymentChanged { house_id: String },
    IncomeCreated {
        scope: IncomeScope,
        date: DateTime<Utc>,
    },
    IncomeChanged { scope: IncomeScope },
    MembershipChanged { house_id: String, group_id: String },
    HouseRemoved {
        house_id: String,
        group_ids: Vec<String>,
    },
    GroupRemoved { group_id: String },
}

/// Notified on the same `Db` the write ran on, before that write commits.
#[async_trait]
pub trait MutationListener: Send + Sync {
    async fn on_mutation(&self, db: &Db, mutation: &Mutation) -> AppResult<()>;
}

pub type SharedListener = Arc<dyn MutationListener>;

pub(crate) async fn notify(
    listener: &Option<SharedListener>,
    db: &Db,
    mutation: Mutation,
) -> AppResult<()> {
    match listener {
        Some(listener) => listener.on_mutation(db, &mutation).await,
        None => Ok(()),
    }
}

pub(crate) fn validate_amount(sum: f64) -> AppResult<()> {
    if sum.is_finite() && sum >= 0.0 {
        Ok(())
    } else {
        Err(
            AppError::new(crate::error::VALIDATION_AMOUNT, "Amounts must be finite and non-negative.")
                .with_context("sum", sum.to_string()),
        )
    }
}

pub(crate) fn validate_date(date: DateTime<Utc>) -> AppResult<()> {
    if is_storable_record_date(date) {
        Ok(())
    } else {
        Err(
            AppError::new(crate::error::VALIDATION_DATE, "Date is past the supported range.")
                .with_context("date", date.to_rfc3339()),
        )
    }
}

/// `(? IS NULL OR col > ?) AND (? IS NULL OR col <= ?)` binds for a window.
pub(crate) fn window_binds(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> [Option<i64>; 4] {
    let from = from.map(to_micros);
    let to = to.map(to_micros);
    [from, from, to, to]
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}
