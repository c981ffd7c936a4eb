use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use super::{notify, HouseService, Mutation, SharedListener};
use crate::db::{Db, Transactional, TxHandle};
use crate::id::new_uuid_v7;
use crate::model::{GroupRef, HouseDto};
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Clone)]
pub struct SqliteHouseService {
    db: Db,
    listener: Option<SharedListener>,
}

impl SqliteHouseService {
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

    pub async fn create(&self, name: &str) -> AppResult<HouseDto> {
        let id = new_uuid_v7();
        let now = now_ms();
        let mut conn = self.db.acquire().await?;
        sqlx::query("INSERT INTO houses (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        info!(target: "homebills", event = "house_created", house_id = %id);
        Ok(HouseDto {
            id,
            name: name.to_string(),
            groups: Vec::new(),
        })
    }

    /// Deletes the house with its payments, house-scoped incomes and pivotal.
    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        let listener = self.listener.clone();
        self.db
            .write_scope(|db| async move {
                let group_ids = {
                    let mut conn = db.acquire().await?;
                    if !house_exists(&mut conn, &id).await? {
                        return Err(AppError::house_not_found(&id));
                    }
                    let groups = load_groups(&mut conn, &id).await?;
                    sqlx::query("DELETE FROM houses WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?;
                    groups.into_iter().map(|g| g.id).collect::<Vec<_>>()
                };
                info!(target: "homebills", event = "house_deleted", house_id = %id);
                notify(
                    &listener,
                    &db,
                    Mutation::HouseRemoved {
                        house_id: id,
                        group_ids,
                    },
                )
                .await
            })
            .await
    }

    pub async fn add_to_group(&self, house_id: &str, group_id: &str) -> AppResult<()> {
        self.change_membership(house_id, group_id, true).await
    }

    pub async fn remove_from_group(&self, house_id: &str, group_id: &str) -> AppResult<()> {
        self.change_membership(house_id, group_id, false).await
    }

    async fn change_membership(&self, house_id: &str, group_id: &str, join: bool) -> AppResult<()> {
        let house_id = house_id.to_string();
        let group_id = group_id.to_string();
        let listener = self.listener.clone();
        self.db
            .write_scope(|db| async move {
                let changed = {
                    let mut conn = db.acquire().await?;
                    if !house_exists(&mut conn, &house_id).await? {
                        return Err(AppError::house_not_found(&house_id));
                    }
                    let group = sqlx::query("SELECT 1 FROM groups WHERE id = ?")
                        .bind(&group_id)
                        .fetch_optional(&mut *conn)
                        .await?;
                    if group.is_none() {
                        return Err(AppError::group_not_found(&group_id));
                    }
                    let sql = if join {
                        "INSERT OR IGNORE INTO house_groups (house_id, group_id) VALUES (?, ?)"
                    } else {
                        "DELETE FROM house_groups WHERE house_id = ? AND group_id = ?"
                    };
                    sqlx::query(sql)
                        .bind(&house_id)
                        .bind(&group_id)
                        .execute(&mut *conn)
                        .await?
                        .rows_affected()
                        > 0
                };
                if !changed {
                    return Ok(());
                }
                info!(
                    target: "homebills",
                    event = "house_membership_changed",
                    house_id = %house_id,
                    group_id = %group_id,
                    joined = join
                );
                notify(
                    &listener,
                    &db,
                    Mutation::MembershipChanged { house_id, group_id },
                )
                .await
            })
            .await
    }
}

impl Transactional for SqliteHouseService {
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            listener: self.listener.clone(),
        }
    }
}

#[async_trait]
impl HouseService for SqliteHouseService {
    async fn find_by_id(&self, id: &str) -> AppResult<HouseDto> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT id, name FROM houses WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::house_not_found(id))?;
        let mut house = deserialize_house(&row)?;
        house.groups = load_groups(&mut conn, &house.id).await?;
        Ok(house)
    }

    async fn exists_by_id(&self, id: &str) -> AppResult<bool> {
        let mut conn = self.db.acquire().await?;
        house_exists(&mut conn, id).await
    }

    async fn find_houses_by_group_id(&self, group_id: &str) -> AppResult<Vec<HouseDto>> {
        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query(
            "SELECT h.id, h.name FROM houses h \
             JOIN house_groups hg ON hg.house_id = h.id \
             WHERE hg.group_id = ? ORDER BY h.name, h.id",
        )
        .bind(group_id)
        .fetch_all(&mut *conn)
        .await?;
        let mut houses = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut house = deserialize_house(row)?;
            house.groups = load_groups(&mut conn, &house.id).await?;
            houses.push(house);
        }
        Ok(houses)
    }
}

fn deserialize_house(row: &SqliteRow) -> AppResult<HouseDto> {
    Ok(HouseDto {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        groups: Vec::new(),
    })
}

async fn house_exists(conn: &mut SqliteConnection, id: &str) -> AppResult<bool> {
    let row = sqlx::query("SELECT 1 FROM houses WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn load_groups(conn: &mut SqliteConnection, house_id: &str) -> AppResult<Vec<GroupRef>> {
    let rows = sqlx::query(
        "SELECT g.id, g.name FROM groups g \
         JOIN house_groups hg ON hg.group_id = g.id \
         WHERE hg.house_id = ? ORDER BY g.name, g.id",
    )
    .bind(house_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(GroupRef {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })
        })
        .collect()
}
