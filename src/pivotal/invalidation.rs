use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use tracing::info;

use super::cache::{CacheKey, PivotalCache};
use super::repo::{GroupPivotalRepository, HousePivotalRepository};
use crate::db::Db;
use crate::model::{IncomeScope, Pivotal};
use crate::services::{HouseService, Mutation, MutationListener};
use crate::time::guarded;
use crate::AppResult;

/// Which watermark an appended record is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Figure {
    Income,
    Payments,
}

impl Figure {
    fn watermark(self, pivotal: &Pivotal) -> Option<DateTime<Utc>> {
        match self {
            Figure::Income => pivotal.latest_income_update_date,
            Figure::Payments => pivotal.latest_payment_update_date,
        }
    }
}

/// A record appended with this date; `None` for every other kind of change.
#[derive(Debug, Clone, Copy)]
struct Append {
    figure: Figure,
    date: DateTime<Utc>,
}

/// Keeps stored and cached pivotals honest after writes to payments,
/// incomes and memberships.
///
/// Stored rows that an incremental refresh could not correct are deleted in
/// the writer's transaction, so the next read rebuilds them. Cache entries
/// are dropped once that transaction commits.
pub struct PivotalInvalidator<H> {
    houses: H,
    house_pivotals: HousePivotalRepository,
    group_pivotals: GroupPivotalRepository,
    cache: Arc<PivotalCache>,
    watermark_guard: TimeDelta,
}

impl<H: HouseService> PivotalInvalidator<H> {
    pub fn new(
        pool: SqlitePool,
        houses: H,
        cache: Arc<PivotalCache>,
        watermark_guard: Duration,
    ) -> Self {
        Self {
            houses,
            house_pivotals: HousePivotalRepository::new(pool.clone()),
            group_pivotals: GroupPivotalRepository::new(pool),
            cache,
            watermark_guard: TimeDelta::from_std(watermark_guard).unwrap_or(TimeDelta::milliseconds(1)),
        }
    }

    async fn groups_of(&self, db: &Db, house_id: &str) -> AppResult<Vec<String>> {
        Ok(db.bind(&self.houses).find_by_id(house_id).await?.group_ids())
    }

    async fn affected(&self, db: &Db, mutation: &Mutation) -> AppResult<(Vec<CacheKey>, Option<Append>)> {
        let house_with_groups = |house_id: &str, groups: Vec<String>| {
            std::iter::once(CacheKey::House(house_id.to_string()))
                .chain(groups.into_iter().map(CacheKey::Group))
                .collect::<Vec<_>>()
        };
        let scope_keys = |scope: &IncomeScope| match scope {
            IncomeScope::House(id) => vec![CacheKey::House(id.clone())],
            IncomeScope::Groups(ids) => ids.iter().cloned().map(CacheKey::Group).collect(),
        };

        Ok(match mutation {
            Mutation::PaymentCreated { house_id, date } => (
                house_with_groups(house_id, self.groups_of(db, house_id).await?),
                Some(Append {
                    figure: Figure::Payments,
                    date: *date,
                }),
            ),
            Mutation::PaymentChanged { house_id } => (
                house_with_groups(house_id, self.groups_of(db, house_id).await?),
                None,
            ),
            Mutation::IncomeCreated { scope, date } => (
                scope_keys(scope),
                Some(Append {
                    figure: Figure::Income,
                    date: *date,
                }),
            ),
            Mutation::IncomeChanged { scope } => (scope_keys(scope), None),
            Mutation::MembershipChanged { house_id, group_id } => (
                vec![
                    CacheKey::House(house_id.clone()),
                    CacheKey::Group(group_id.clone()),
                ],
                None,
            ),
            Mutation::HouseRemoved {
                house_id,
                group_ids,
            } => (house_with_groups(house_id, group_ids.clone()), None),
            Mutation::GroupRemoved { group_id } => (vec![CacheKey::Group(group_id.clone())], None),
        })
    }

    /// Whether the stored row for `key` must go. Only an append dated past
    /// `watermark + guard` is picked up by the next incremental refresh.
    async fn must_drop(&self, db: &Db, key: &CacheKey, append: Option<Append>) -> AppResult<bool> {
        let Some(append) = append else {
            return Ok(true);
        };
        let stored = match key {
            CacheKey::House(id) => db
                .bind(&self.house_pivotals)
                .find_by_source_id(id)
                .await?
                .map(|p| p.pivotal),
            CacheKey::Group(id) => db
                .bind(&self.group_pivotals)
                .find_by_source_id(id)
                .await?
                .map(|p| p.pivotal),
        };
        let Some(stored) = stored else {
            return Ok(false);
        };
        Ok(match append.figure.watermark(&stored) {
            Some(watermark) => append.date <= guarded(watermark, self.watermark_guard)?,
            None => false,
        })
    }

    async fn drop_stored(&self, db: &Db, key: &CacheKey) -> AppResult<u64> {
        match key {
            CacheKey::House(id) => db.bind(&self.house_pivotals).delete_by_source_id(id).await,
            CacheKey::Group(id) => db.bind(&self.group_pivotals).delete_by_source_id(id).await,
        }
    }
}

#[async_trait]
impl<H: HouseService> MutationListener for PivotalInvalidator<H> {
    async fn on_mutation(&self, db: &Db, mutation: &Mutation) -> AppResult<()> {
        let (keys, append) = self.affected(db, mutation).await?;
        for key in &keys {
            let dropped = if self.must_drop(db, key, append).await? {
                self.drop_stored(db, key).await?
            } else {
                0
            };
            info!(
                target: "homebills",
                event = "pivotal_invalidate",
                source_id = %key.source_id(),
                stored_rows_dropped = dropped,
                append = append.is_some()
            );
        }
        let cache = self.cache.clone();
        db.after_commit(move || {
            for key in &keys {
                cache.invalidate(key);
            }
        });
        Ok(())
    }
}
