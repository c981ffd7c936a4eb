//! Household bills with per-house and per-group financial pivotals.

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod pivotal;
pub mod services;
pub mod state;
pub mod time;

pub use db::{open_sqlite_pool, with_tx, Db, Transactional, TxHandle};
pub use error::{AppError, AppResult, ErrorKind};
pub use state::AppState;
