use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::cache::{CacheKey, PivotalCache, Ticket};
use super::calculator::PivotalCalculator;
use super::repo::{GroupPivotalRepository, HousePivotalRepository, PivotalRepository, StoredPivotal};
use super::{retry_transient, RetryPolicy};
use crate::db::{with_tx, Db, Transactional, TxHandle};
use crate::model::{Delta, GroupPivotal, HousePivotal, Pivotal};
use crate::time::guarded;
use crate::services::{GroupService, HouseService, IncomeService, PaymentService, ALL};
use crate::{AppError, AppResult};

/// Read side of the pivotal engine: cache first, then the stored row brought
/// forward by the records appended since its watermarks, then a full
/// recompute when nothing is stored.
#[derive(Clone)]
pub struct PivotalService<H, G, I, P> {
    db: Db,
    houses: H,
    groups: G,
    incomes: I,
    payments: P,
    house_pivotals: HousePivotalRepository,
    group_pivotals: GroupPivotalRepository,
    calculator: PivotalCalculator<H, I, P>,
    cache: Arc<PivotalCache>,
    watermark_guard: TimeDelta,
    retry: RetryPolicy,
}

impl<H, G, I, P> PivotalService<H, G, I, P>
where
    H: HouseService,
    G: GroupService,
    I: IncomeService,
    P: PaymentService,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        houses: H,
        groups: G,
        incomes: I,
        payments: P,
        calculator: PivotalCalculator<H, I, P>,
        cache: Arc<PivotalCache>,
        watermark_guard: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            house_pivotals: HousePivotalRepository::new(pool.clone()),
            group_pivotals: GroupPivotalRepository::new(pool.clone()),
            db: Db::Pool(pool),
            houses,
            groups,
            incomes,
            payments,
            calculator,
            cache,
            watermark_guard: TimeDelta::from_std(watermark_guard)
                .unwrap_or(TimeDelta::milliseconds(1)),
            retry,
        }
    }

    pub fn cache(&self) -> &Arc<PivotalCache> {
        &self.cache
    }

    pub async fn find_by_house_id(&self, house_id: &str) -> AppResult<HousePivotal> {
        if !self.houses.exists_by_id(house_id).await? {
            return Err(AppError::house_not_found(house_id));
        }
        let key = CacheKey::House(house_id.to_string());
        if let Some(pivotal) = self.cache.find(&key) {
            return Ok(HousePivotal::from_parts(pivotal, house_id.to_string()));
        }
        let ticket = self.cache.ticket();
        match &self.db {
            Db::Tx(_) => self.refresh_house(house_id, ticket).await,
            Db::Pool(pool) => {
                retry_transient(self.retry, "refresh_house", house_id, || {
                    with_tx(pool, |tx| {
                        let bound = self.transactional(&tx);
                        async move { bound.refresh_house(house_id, ticket).await }
                    })
                })
                .await
            }
        }
    }

    pub async fn find_by_group_id(&self, group_id: &str) -> AppResult<GroupPivotal> {
        if !self.groups.exists_by_id(group_id).await? {
            return Err(AppError::group_not_found(group_id));
        }
        let key = CacheKey::Group(group_id.to_string());
        if let Some(pivotal) = self.cache.find(&key) {
            return Ok(GroupPivotal::from_parts(pivotal, group_id.to_string()));
        }
        let ticket = self.cache.ticket();
        match &self.db {
            Db::Tx(_) => self.refresh_group(group_id, ticket).await,
            Db::Pool(pool) => {
                retry_transient(self.retry, "refresh_group", group_id, || {
                    with_tx(pool, |tx| {
                        let bound = self.transactional(&tx);
                        async move { bound.refresh_group(group_id, ticket).await }
                    })
                })
                .await
            }
        }
    }

    async fn refresh_house(&self, house_id: &str, ticket: Ticket) -> AppResult<HousePivotal> {
        let Some(stored) = self.house_pivotals.find_by_source_id(house_id).await? else {
            info!(target: "homebills", event = "pivotal_rebuild_on_read", kind = "house", source_id = %house_id);
            return Ok(self.calculator.calculate(house_id).await?.house);
        };
        let income = self
            .incomes
            .calculate_delta_by_house_id(
                house_id,
                self.lower_bound(stored.pivotal.latest_income_update_date)?,
            )
            .await?;
        let payments = self
            .payments
            .calculate_delta(
                std::slice::from_ref(&stored.house_id),
                self.lower_bound(stored.pivotal.latest_payment_update_date)?,
            )
            .await?;
        self.accumulate(&self.house_pivotals, stored, income, payments, ticket)
            .await
    }

    async fn refresh_group(&self, group_id: &str, ticket: Ticket) -> AppResult<GroupPivotal> {
        let members = self.houses.find_houses_by_group_id(group_id).await?;
        let Some(stored) = self.group_pivotals.find_by_source_id(group_id).await? else {
            return match members.first() {
                Some(house) => {
                    info!(
                        target: "homebills",
                        event = "pivotal_rebuild_on_read",
                        kind = "group",
                        source_id = %group_id,
                        via_house = %house.id
                    );
                    let response = self.calculator.calculate(&house.id).await?;
                    response
                        .groups
                        .into_iter()
                        .find(|g| g.group_id == group_id)
                        .ok_or_else(|| {
                            AppError::invariant("recompute of a member house skipped its group")
                                .with_context("group_id", group_id)
                                .with_context("house_id", house.id.as_str())
                        })
                }
                None => self.memberless_group(group_id).await,
            };
        };
        let house_ids: Vec<String> = members.into_iter().map(|h| h.id).collect();
        let income = self
            .incomes
            .calculate_delta_by_group_id(
                group_id,
                self.lower_bound(stored.pivotal.latest_income_update_date)?,
            )
            .await?;
        let payments = self
            .payments
            .calculate_delta(
                &house_ids,
                self.lower_bound(stored.pivotal.latest_payment_update_date)?,
            )
            .await?;
        self.accumulate(&self.group_pivotals, stored, income, payments, ticket)
            .await
    }

    /// A group without member houses only carries its own incomes. The value
    /// is computed for the caller and neither stored nor cached.
    async fn memberless_group(&self, group_id: &str) -> AppResult<GroupPivotal> {
        let mut pivotal = GroupPivotal::new(group_id);
        let incomes = self
            .incomes
            .find_by_group_ids(&[group_id.to_string()], ALL, ALL, None, None)
            .await?;
        pivotal.pivotal.fold_incomes(&incomes);
        info!(
            target: "homebills",
            event = "pivotal_memberless_group",
            group_id = %group_id,
            incomes = incomes.len()
        );
        Ok(pivotal)
    }

    fn lower_bound(&self, watermark: Option<DateTime<Utc>>) -> AppResult<Option<DateTime<Utc>>> {
        watermark
            .map(|w| guarded(w, self.watermark_guard))
            .transpose()
    }

    async fn accumulate<S: StoredPivotal + KeyedPivotal>(
        &self,
        repo: &PivotalRepository<S>,
        stored: S,
        income: Delta,
        payments: Delta,
        ticket: Ticket,
    ) -> AppResult<S> {
        let key = stored.cache_key();
        if income.is_empty() && payments.is_empty() {
            self.publish_after_commit(key, ticket, stored.pivotal().clone());
            return Ok(stored);
        }

        let mut next = stored.clone();
        next.pivotal_mut().apply(&income, &payments);
        if !repo.replace(stored.pivotal(), &next).await? {
            warn!(
                target: "homebills",
                event = "pivotal_incremental_conflict",
                kind = S::KIND,
                source_id = %stored.source_id()
            );
            return Ok(next);
        }
        info!(
            target: "homebills",
            event = "pivotal_incremental_apply",
            kind = S::KIND,
            source_id = %stored.source_id(),
            income_delta = income.sum,
            payments_delta = payments.sum
        );
        self.publish_after_commit(key, ticket, next.pivotal().clone());
        Ok(next)
    }

    fn publish_after_commit(&self, key: CacheKey, ticket: Ticket, value: Pivotal) {
        let cache = self.cache.clone();
        self.db.after_commit(move || {
            cache.add_if_current(key, ticket, value);
        });
    }
}

impl<H, G, I, P> Transactional for PivotalService<H, G, I, P>
where
    H: HouseService,
    G: GroupService,
    I: IncomeService,
    P: PaymentService,
{
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            houses: self.houses.transactional(tx),
            groups: self.groups.transactional(tx),
            incomes: self.incomes.transactional(tx),
            payments: self.payments.transactional(tx),
            house_pivotals: self.house_pivotals.transactional(tx),
            group_pivotals: self.group_pivotals.transactional(tx),
            calculator: self.calculator.transactional(tx),
            cache: self.cache.clone(),
            watermark_guard: self.watermark_guard,
            retry: self.retry,
        }
    }
}

/// Mutable access and cache key for the two stored variants.
trait KeyedPivotal {
    fn pivotal_mut(&mut self) -> &mut Pivotal;
    fn cache_key(&self) -> CacheKey;
}

impl KeyedPivotal for HousePivotal {
    fn pivotal_mut(&mut self) -> &mut Pivotal {
        &mut self.pivotal
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::House(self.house_id.clone())
    }
}

impl KeyedPivotal for GroupPivotal {
    fn pivotal_mut(&mut self) -> &mut Pivotal {
        &mut self.pivotal
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::Group(self.group_id.clone())
    }
}
