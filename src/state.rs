use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::AppConfig;
use crate::pivotal::{PivotalCache, PivotalCalculator, PivotalInvalidator, PivotalService, RetryPolicy};
use crate::services::{
    SharedListener, SqliteGroupService, SqliteHouseService, SqliteIncomeService,
    SqlitePaymentService,
};

pub type Calculator = PivotalCalculator<SqliteHouseService, SqliteIncomeService, SqlitePaymentService>;
pub type Pivotals = PivotalService<
    SqliteHouseService,
    SqliteGroupService,
    SqliteIncomeService,
    SqlitePaymentService,
>;

/// The wired object graph. Write-side services report to the invalidator;
/// the read side shares the same cache.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
    pub cache: Arc<PivotalCache>,
    pub houses: SqliteHouseService,
    pub groups: SqliteGroupService,
    pub incomes: SqliteIncomeService,
    pub payments: SqlitePaymentService,
    pub calculator: Calculator,
    pub pivotals: Pivotals,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: AppConfig) -> Self {
        let cache = Arc::new(PivotalCache::new(&config.cache));
        let retry = RetryPolicy::from(&config);

        // Readers: no listener, they never write.
        let house_reader = SqliteHouseService::new(pool.clone());
        let group_reader = SqliteGroupService::new(pool.clone());
        let income_reader = SqliteIncomeService::new(pool.clone());
        let payment_reader = SqlitePaymentService::new(pool.clone());

        let listener: SharedListener = Arc::new(PivotalInvalidator::new(
            pool.clone(),
            house_reader.clone(),
            cache.clone(),
            config.watermark_guard,
        ));

        let calculator = PivotalCalculator::new(
            pool.clone(),
            house_reader.clone(),
            income_reader.clone(),
            payment_reader.clone(),
            cache.clone(),
            retry,
        );
        let pivotals = PivotalService::new(
            pool.clone(),
            house_reader,
            group_reader,
            income_reader,
            payment_reader,
            calculator.clone(),
            cache.clone(),
            config.watermark_guard,
            retry,
        );

        Self {
            houses: SqliteHouseService::new(pool.clone()).with_listener(listener.clone()),
            groups: SqliteGroupService::new(pool.clone()).with_listener(listener.clone()),
            incomes: SqliteIncomeService::new(pool.clone()).with_listener(listener.clone()),
            payments: SqlitePaymentService::new(pool.clone()).with_listener(listener),
            pool,
            config: Arc::new(config),
            cache,
            calculator,
            pivotals,
        }
    }
}
