use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{notify, GroupService, Mutation, SharedListener};
use crate::db::{Db, Transactional, TxHandle};
use crate::id::new_uuid_v7;
use crate::model::GroupDto;
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Clone)]
pub struct SqliteGroupService {
    db: Db,
    listener: Option<SharedListener>,
}

impl SqliteGroupService {
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

    pub async fn create(&self, name: &str) -> AppResult<GroupDto> {
        let id = new_uuid_v7();
        let now = now_ms();
        let mut conn = self.db.acquire().await?;
        sqlx::query("INSERT INTO groups (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        info!(target: "homebills", event = "group_created", group_id = %id);
        Ok(GroupDto {
            id,
            name: name.to_string(),
        })
    }

    pub async fn find_by_id(&self, id: &str) -> AppResult<GroupDto> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT id, name FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::group_not_found(id))?;
        Ok(GroupDto {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    /// Deletes the group, its memberships, its group-scoped income links and
    /// its pivotal.
    pub async fn delete(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        let listener = self.listener.clone();
        self.db
            .write_scope(|db| async move {
                {
                    let mut conn = db.acquire().await?;
                    let deleted = sqlx::query("DELETE FROM groups WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *conn)
                        .await?
                        .rows_affected();
                    if deleted == 0 {
                        return Err(AppError::group_not_found(&id));
                    }
                }
                info!(target: "homebills", event = "group_deleted", group_id = %id);
                notify(&listener, &db, Mutation::GroupRemoved { group_id: id }).await
            })
            .await
    }
}

impl Transactional for SqliteGroupService {
    fn transactional(&self, tx: &TxHandle) -> Self {
        Self {
            db: Db::Tx(tx.clone()),
            listener: self.listener.clone(),
        }
    }
}

#[async_trait]
impl GroupService for SqliteGroupService {
    async fn exists_by_id(&self, id: &str) -> AppResult<bool> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT 1 FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }
}
