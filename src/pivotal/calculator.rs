use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use super::cache::{CacheKey, PivotalCache, Ticket};
use super::repo::{GroupPivotalRepository, HousePivotalRepository, PivotalColumn};
use super::{retry_transient, RetryPolicy};
use crate::db::{with_tx, Db, Transactional, TxHandle};
use crate::model::{GroupPivotal, HousePivotal, PivotalResponse, TotalPivotal};
use crate::services::{HouseService, IncomeService, PaymentService, ALL};
use crate::AppResult;

/// Authoritative rebuild of one house's pivotal and the pivotals of every
/// group it belongs to.
#[derive(Clone)]
pub struct PivotalCalculator<H, I, P> {
    db: Db,
    houses: H,
    incomes: I,
    payments: P,
    house_pivotals: HousePivotalRepository,
    group_pivotals: GroupPivotalRepository,
    cache: Arc<PivotalCache>,
    retry: RetryPolicy,
}

impl<H, I, P> PivotalCalculator<H, I, P>
where
    H: HouseService,
    I: IncomeService,
    P: PaymentService,
{
    pub fn new(
        pool: SqlitePool,
        houses: H,
        incomes: I,
        payments: P,
        cache: Arc<PivotalCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            house_pivotals: HousePivotalRepository::new(pool.clone()),
            group_pivotals: GroupPivotalRepository::new(pool.clone()),
            db: Db::Pool(pool),
            houses,
            incomes,
            payments,
            cache,
            retry,
        }
    }

    /// Runs in its own transaction when bound to the pool, retrying transient
    /// store errors. Bound to a caller's transaction it runs exactly once
    /// inside it. The cache sees the new values only after commit.
    pub async fn calculate(&self, house_id: &str) -> AppResult<PivotalResponse> {
        let ticket = self.cache.ticket();
        match &self.db {
            Db::Tx(_) => self.recompute(house_id, ticket).await,
            Db::Pool(pool) => {
                retry_transient(self.retry, "recompute", house_id, || {
                    with_tx(pool, |tx| {
                        let bound = self.transactional(&tx);
                        async move { bound.recompute(house_id, ticket).await }
                    })
                })
                .await
            }
        }
    }

    async fn recompute(&self, house_id: &str, ticket: Ticket) -> AppResult<PivotalResponse> {
        info!(target: "homebills", event = "pivotal_recompute_start", house_id = %house_id);
        let house = self.houses.find_by_id(house_id).await?;

        self.house_pivotals
            .delete_by(PivotalColumn::Source, house_id)
            .await?;

        let mut record_count = 0usize;
        let mut groups = Vec::with_capacity(house.groups.len());
        for group in &house.groups {
            self.group_pivotals
                .delete_by(PivotalColumn::Source, &group.id)
                .await?;

            let mut pivotal = GroupPivotal::new(group.id.clone());
            let payments = self
                .payments
                .find_by_group_id(&group.id, ALL, ALL, None, None)
                .await?;
            pivotal.pivotal.fold_payments(&payments);
            let incomes = self
                .incomes
                .find_by_group_ids(std::slice::from_ref(&group.id), ALL, ALL, None, None)
                .await?;
            pivotal.pivotal.fold_incomes(&incomes);
            record_count += payments.len() + incomes.len();
            groups.push(pivotal);
        }
        self.group_pivotals.create_batch(&groups).await?;

        let mut house_pivotal = HousePivotal::new(house_id);
        let payments = self
            .payments
            .find_by_house_id(house_id, ALL, ALL, None, None)
            .await?;
        house_pivotal.pivotal.fold_payments(&payments);
        let incomes = self
            .incomes
            .find_by_house_id(house_id, ALL, ALL, None, None)
            .await?;
        house_pivotal.pivotal.fold_incomes(&incomes);
        record_count += payments.len() + incomes.len();
        self.house_pivotals.create(&house_pivotal).await?;

        self.publish_after_commit(&house_pivotal, &groups, ticket);

        let total = TotalPivotal::for_response(&house_pivotal, &groups);
        info!(
            target: "homebills",
            event = "pivotal_recompute_done",
            house_id = %house_id,
            groups = groups.len(),
            records = record_count,
            total = total.total
        );
        Ok(PivotalResponse {
            house: house_pivotal,
            groups,
            total,
        })
    }

    fn publish_after_commit(&self, house: &HousePivotal, groups: &[GroupPivotal], ticket: Ticket) {
        let cache = self.cache.clone();
        let mut values = Vec::with_capacity(groups.len() + 1);
        values.push((CacheKey::House(house.house_id.clone()), house.pivotal.clone()));
        values.extend(
            groups
                .iter()
                .map(|g| (CacheKey::Group(g.group_id.clone()), g.pivotal.clone())),
        );
        self.db.after_commit(move || {
            for (key, value) in values {
                cache.add_if_current(key, ticket, value);
            }
        });
    }
}

impl<H, I, P> Transactional for PivotalCalculator<H, I, P>
where
    H: HouseService,
    I: IncomeService,
    P: PaymentService,
{
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            houses: self.houses.transactional(tx),
            incomes: self.incomes.transactional(tx),
            payments: self.payments.transactional(tx),
            house_pivotals: self.house_pivotals.transactional(tx),
            group_pivotals: self.group_pivotals.transactional(tx),
            cache: self.cache.clone(),
            retry: self.retry,
        }
    }
}
