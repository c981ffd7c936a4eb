use anyhow::Result;
use homebills_lib::error::{ErrorKind, PIVOTAL_INVALID_COLUMN};
use homebills_lib::model::{GroupPivotal, HousePivotal};
use homebills_lib::pivotal::{
    GroupPivotalRepository, HousePivotalRepository, PivotalColumn, StoredPivotal,
};
use homebills_lib::{with_tx, AppError, Transactional};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn create_find_exists_delete() -> Result<()> {
    let state = util::app().await;
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    let repo = HousePivotalRepository::new(state.pool.clone());

    assert!(repo.find_by_source_id(&house_id).await?.is_none());

    let mut pivotal = HousePivotal::new(&house_id);
    pivotal.pivotal.add_income(250.0);
    pivotal.pivotal.add_payment(100.0);
    repo.create(&pivotal).await?;

    assert!(repo.exists(&pivotal.pivotal.id).await?);
    let stored = repo.find_by_source_id(&house_id).await?.expect("stored");
    assert_eq!(stored, pivotal);

    assert_eq!(repo.delete_by(PivotalColumn::Source, &house_id).await?, 1);
    // Idempotent.
    assert_eq!(repo.delete_by(PivotalColumn::Source, &house_id).await?, 0);
    assert!(!repo.exists(&pivotal.pivotal.id).await?);
    Ok(())
}

#[tokio::test]
async fn batch_insert_only_writes_pivotal_rows() -> Result<()> {
    let state = util::app().await;
    let g1 = util::group(&state, "G1").await;
    let g2 = util::group(&state, "G2").await;
    let repo = GroupPivotalRepository::new(state.pool.clone());

    repo.create_batch(&[]).await?;
    repo.create_batch(&[GroupPivotal::new(&g1), GroupPivotal::new(&g2)])
        .await?;

    assert_eq!(util::count(&state.pool, "group_pivotals").await, 2);
    assert_eq!(util::count(&state.pool, "groups").await, 2);
    assert_eq!(util::count(&state.pool, "incomes").await, 0);
    Ok(())
}

#[tokio::test]
async fn second_row_for_a_source_is_refused() -> Result<()> {
    let state = util::app().await;
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    let repo = HousePivotalRepository::new(state.pool.clone());

    repo.create(&HousePivotal::new(&house_id)).await?;
    let err = repo.create(&HousePivotal::new(&house_id)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermanentStore);
    assert_eq!(util::count(&state.pool, "house_pivotals").await, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_rows_surface_as_invariant_violation() -> Result<()> {
    let state = util::app().await;
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    sqlx::query("DROP INDEX idx_house_pivotals_house")
        .execute(&state.pool)
        .await?;
    let repo = HousePivotalRepository::new(state.pool.clone());
    repo.create(&HousePivotal::new(&house_id)).await?;
    repo.create(&HousePivotal::new(&house_id)).await?;

    let err = repo.find_by_source_id(&house_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    assert_eq!(err.context().get("source_id"), Some(&house_id));
    // Never repaired.
    assert_eq!(util::count(&state.pool, "house_pivotals").await, 2);
    Ok(())
}

#[tokio::test]
async fn replace_is_conditional_on_prior_watermarks() -> Result<()> {
    let state = util::app().await;
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    let repo = HousePivotalRepository::new(state.pool.clone());
    let original = HousePivotal::new(&house_id);
    repo.create(&original).await?;

    let mut next = original.clone();
    next.pivotal.add_payment(40.0);
    next.pivotal.latest_payment_update_date = Some(util::day(2021, 3, 1));
    assert!(repo.replace(&original.pivotal, &next).await?);

    // `original` no longer describes the stored row.
    let mut stale = original.clone();
    stale.pivotal.add_payment(99.0);
    assert!(!repo.replace(&original.pivotal, &stale).await?);

    let stored = repo.find_by_source_id(&house_id).await?.expect("stored");
    assert_eq!(stored.pivotal.payments, 40.0);
    assert_eq!(stored.pivotal.total, -40.0);
    Ok(())
}

#[tokio::test]
async fn transactional_view_rolls_back_with_its_transaction() -> Result<()> {
    let state = util::app().await;
    let house_id = util::house_in_groups(&state, "H1", &[]).await;
    let repo = HousePivotalRepository::new(state.pool.clone());

    let res = with_tx(&state.pool, |tx| {
        let bound = repo.transactional(&tx);
        let pivotal = HousePivotal::new(&house_id);
        async move {
            bound.create(&pivotal).await?;
            assert!(bound.exists(&pivotal.pivotal.id).await?);
            Err::<(), _>(AppError::from("abort"))
        }
    })
    .await;
    assert!(res.is_err());
    assert!(repo.find_by_source_id(&house_id).await?.is_none());
    Ok(())
}

#[test]
fn column_names_are_checked() {
    assert_eq!(
        PivotalColumn::parse::<HousePivotal>("house_id").unwrap(),
        PivotalColumn::Source
    );
    assert_eq!(
        PivotalColumn::parse::<GroupPivotal>("id").unwrap(),
        PivotalColumn::Id
    );
    let err = PivotalColumn::parse::<GroupPivotal>("house_id").unwrap_err();
    assert_eq!(err.code(), PIVOTAL_INVALID_COLUMN);
    assert_eq!(GroupPivotal::SOURCE_COLUMN, "group_id");
}
