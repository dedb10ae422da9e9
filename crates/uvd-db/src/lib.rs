//! Postgres-backed order store.
//!
//! Layout:
//! - [`query`] — the parameterized SQL builder behind advanced and paged
//!   queries (pure, unit-tested without a database).
//! - [`pg`] — [`PgStore`]: typed CRUD over the four tables plus the
//!   [`DispatchStore`] seam the pipeline consumes.
//! - [`partition`] — monthly range-partition maintenance for the grab log.
//!
//! Integration tests that need a live database are `#[ignore]`-gated on
//! `UVD_DATABASE_URL`.

pub mod partition;
pub mod pg;
pub mod query;
mod store;

pub use pg::PgStore;
pub use query::{PageResult, QuerySpec, SqlParam};
pub use store::DispatchStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

/// Environment variable carrying the Postgres URL.
pub const ENV_DB_URL: &str = "UVD_DATABASE_URL";

/// Pool bounds: configured size is clamped to at least this floor.
pub const MIN_POOL_SIZE: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The claim CAS touched zero rows: version conflict or tombstone.
    #[error("claim lost for order {0}")]
    ClaimLost(i64),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    /// Unique-key conflict (SQLSTATE 23505).
    #[error("duplicate key: {0}")]
    Duplicate(String),
    /// Malformed query request, e.g. paging without an order-by.
    #[error("bad query: {0}")]
    BadQuery(String),
    /// Deadlock detected by the database (SQLSTATE 40P01); safe to retry.
    #[error("database deadlock")]
    Deadlock,
    #[error("database error: {0}")]
    Db(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("23505") => {
                    return StoreError::Duplicate(db_err.message().to_string());
                }
                Some("40P01") => return StoreError::Deadlock,
                _ => {}
            }
        }
        StoreError::Db(err)
    }
}

/// Connect using `UVD_DATABASE_URL`, clamping the pool to a sane size and
/// verifying connectivity eagerly (startup failures must surface at boot).
pub async fn connect_from_env(pool_size: u32) -> Result<PgPool, StoreError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| StoreError::BadQuery(format!("missing env var {ENV_DB_URL}")))?;
    connect(&url, pool_size).await
}

pub async fn connect(url: &str, pool_size: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size.max(MIN_POOL_SIZE))
        .connect(url)
        .await?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::BadQuery(format!("migrate failed: {e}")))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_order_table: bool,
}

/// Connectivity + schema presence probe, for CLI/daemon status surfaces.
pub async fn status(pool: &PgPool) -> Result<DbStatus, StoreError> {
    let (one,): (i32,) = sqlx::query_as("select 1").fetch_one(pool).await?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'uv_order'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DbStatus {
        ok: one == 1,
        has_order_table: exists,
    })
}
