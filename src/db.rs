use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::error::DB_TX_CLOSED;
use crate::id::new_uuid_v7;
use crate::{AppError, AppResult};

type SqliteTx = Transaction<'static, Sqlite>;
type AfterCommit = Box<dyn FnOnce() + Send>;

pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            error!(
                target: "homebills",
                event = "db_dir_create_failed",
                error = %e,
                path = %parent.display()
            );
            AppError::from(e)
        })?;
    }
    info!(target: "homebills", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "homebills",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "homebills",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Handle to one open transaction. Clones share the transaction; once the
/// owning [`with_tx`] scope ends every clone fails with `DB/TX_CLOSED`.
#[derive(Clone)]
pub struct TxHandle {
    id: Arc<str>,
    slot: Arc<Mutex<Option<SqliteTx>>>,
    after_commit: Arc<StdMutex<Vec<AfterCommit>>>,
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle").field("id", &self.id).finish()
    }
}

impl TxHandle {
    async fn begin(pool: &SqlitePool) -> AppResult<Self> {
        let tx = pool.begin().await?;
        Ok(Self {
            id: Arc::from(new_uuid_v7()),
            slot: Arc::new(Mutex::new(Some(tx))),
            after_commit: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue in-memory work to run once the transaction has committed.
    /// Dropped on rollback.
    pub fn after_commit(&self, callback: impl FnOnce() + Send + 'static) {
        self.after_commit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    async fn acquire(&self) -> AppResult<DbConn> {
        let guard = self.slot.clone().lock_owned().await;
        if guard.is_none() {
            return Err(AppError::new(
                DB_TX_CLOSED,
                "Transaction handle used after its scope ended",
            )
            .with_context("tx_id", self.id.to_string()));
        }
        Ok(DbConn(ConnInner::Tx(guard)))
    }

    async fn close(&self) -> Option<SqliteTx> {
        self.slot.lock().await.take()
    }

    fn drain_after_commit(&self) -> Vec<AfterCommit> {
        std::mem::take(&mut *self.after_commit.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Where store operations run: straight on the pool (autocommit) or inside a
/// caller-owned transaction.
#[derive(Clone, Debug)]
pub enum Db {
    Pool(SqlitePool),
    Tx(TxHandle),
}

impl Db {
    pub async fn acquire(&self) -> AppResult<DbConn> {
        match self {
            Db::Pool(pool) => Ok(DbConn(ConnInner::Pool(pool.acquire().await?))),
            Db::Tx(tx) => tx.acquire().await,
        }
    }

    /// Runs `callback` now for the pool, or after commit for a transaction.
    pub fn after_commit(&self, callback: impl FnOnce() + Send + 'static) {
        match self {
            Db::Pool(_) => callback(),
            Db::Tx(tx) => tx.after_commit(callback),
        }
    }

    /// View of `component` that executes against this handle.
    pub fn bind<T: Transactional + Clone>(&self, component: &T) -> T {
        match self {
            Db::Pool(_) => component.clone(),
            Db::Tx(tx) => component.transactional(tx),
        }
    }

    /// Run `f` inside a transaction: the caller's one when bound to a
    /// transaction, a fresh one otherwise.
    pub async fn write_scope<R, F, Fut>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = AppResult<R>>,
    {
        match self {
            Db::Pool(pool) => with_tx(pool, |tx| f(Db::Tx(tx))).await,
            Db::Tx(_) => f(self.clone()).await,
        }
    }
}

/// A connection borrowed from the pool or the locked transaction.
pub struct DbConn(ConnInner);

enum ConnInner {
    Pool(PoolConnection<Sqlite>),
    // Only constructed after the slot was checked to be `Some`.
    Tx(OwnedMutexGuard<Option<SqliteTx>>),
}

impl Deref for DbConn {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match &self.0 {
            ConnInner::Pool(conn) => conn,
            ConnInner::Tx(slot) => match slot.as_deref() {
                Some(conn) => conn,
                None => unreachable!("transaction slot emptied while locked"),
            },
        }
    }
}

impl DerefMut for DbConn {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match &mut self.0 {
            ConnInner::Pool(conn) => conn,
            ConnInner::Tx(slot) => match slot.as_deref_mut() {
                Some(conn) => conn,
                None => unreachable!("transaction slot emptied while locked"),
            },
        }
    }
}

/// Components that can produce a copy of themselves bound to a transaction.
/// The copy routes every store operation through `tx` and never opens a
/// transaction of its own.
pub trait Transactional: Sized {
    fn transactional(&self, tx: &TxHandle) -> Self;
}

/// Run work inside a transaction. Commits on success, rolls back on error.
/// A panic inside `f` drops the transaction, which rolls it back.
pub async fn with_tx<R, E, F, Fut>(pool: &SqlitePool, f: F) -> Result<R, E>
where
    E: From<AppError>,
    F: FnOnce(TxHandle) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let handle = TxHandle::begin(pool).await.map_err(E::from)?;
    info!(target: "homebills", event = "db_tx_begin", tx_id = %handle.id());

    let outcome = f(handle.clone()).await;
    let tx = handle.close().await;

    match (outcome, tx) {
        (Ok(val), Some(tx)) => {
            tx.commit().await.map_err(|e| E::from(AppError::from(e)))?;
            info!(target: "homebills", event = "db_tx_commit", tx_id = %handle.id());
            for callback in handle.drain_after_commit() {
                callback();
            }
            Ok(val)
        }
        (Err(e), Some(tx)) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: "homebills", event = "db_tx_rollback_failed", tx_id = %handle.id(), error = %rb);
            } else {
                warn!(target: "homebills", event = "db_tx_rollback", tx_id = %handle.id());
            }
            Err(e)
        }
        (Ok(_), None) => Err(E::from(AppError::new(
            DB_TX_CLOSED,
            "Transaction was closed before it could commit",
        ))),
        (Err(e), None) => Err(e),
    }
}
